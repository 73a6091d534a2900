//! JSON-lines request and response shapes.
//!
//! Each request is one JSON object on one line, tagged by `op`:
//!
//! ```text
//! {"op":"login","user_id":"01J...","password":"secret"}
//! {"op":"save_booking","member_id":"01J...","court_id":"01J...","date":"2024-06-01","range":{"start":"14:00:00","end":"15:00:00"}}
//! ```
//!
//! Replies are `{"ok":true,"data":...}` or
//! `{"ok":false,"error":{"kind":"schedule_conflict","message":"..."}}`.
//! Events pushed by `watch` arrive as `{"event":...}`.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::engine::{EngineError, RecurringClass, ScheduleKey};
use crate::model::*;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Login {
        user_id: Ulid,
        password: String,
    },

    // members
    RegisterMember {
        profile: MemberProfile,
    },
    UpdateMember {
        id: Ulid,
        profile: MemberProfile,
    },
    SetMemberActive {
        id: Ulid,
        active: bool,
    },
    DeleteMember {
        id: Ulid,
    },
    GetMember {
        id: Ulid,
    },
    FindMember {
        national_id: String,
    },
    ListMembers,

    // plans
    CreatePlan {
        name: String,
        #[serde(default)]
        description: Option<String>,
        price: i64,
        duration_days: u32,
        may_reserve_courts: bool,
        may_reserve_classes: bool,
    },
    UpdatePlan {
        plan: Plan,
    },
    DeletePlan {
        id: Ulid,
    },
    ListPlans,
    AssignPlan {
        member_id: Ulid,
        plan_id: Ulid,
        start_date: NaiveDate,
        #[serde(default)]
        amount_paid: i64,
    },
    DeactivateSubscription {
        id: Ulid,
    },
    Subscriptions {
        member_id: Ulid,
    },
    CurrentPlan {
        member_id: Ulid,
        #[serde(default)]
        today: Option<NaiveDate>,
    },
    CheckEntitlement {
        member_id: Ulid,
        capability: Capability,
    },

    // users
    RegisterUser {
        national_id: String,
        name: String,
        role: Role,
        #[serde(default)]
        member_id: Option<Ulid>,
    },
    DeleteUser {
        id: Ulid,
    },
    ListUsers,

    // courts and bookings
    CreateCourt {
        name: String,
        kind: CourtKind,
    },
    UpdateCourt {
        id: Ulid,
        name: String,
        kind: CourtKind,
    },
    SetCourtActive {
        id: Ulid,
        active: bool,
    },
    DeleteCourt {
        id: Ulid,
    },
    ListCourts,
    CheckConflict {
        key: ScheduleKey,
        date: NaiveDate,
        range: TimeRange,
        #[serde(default)]
        exclude: Option<Ulid>,
    },
    SaveBooking {
        /// Defaults to the logged-in member.
        #[serde(default)]
        member_id: Option<Ulid>,
        court_id: Ulid,
        date: NaiveDate,
        range: TimeRange,
        #[serde(default)]
        booking_id: Option<Ulid>,
    },
    CancelBooking {
        id: Ulid,
    },
    CourtBookings {
        court_id: Ulid,
        date: NaiveDate,
    },
    CourtAvailability {
        court_id: Ulid,
        date: NaiveDate,
        opening: TimeRange,
        #[serde(default)]
        min_minutes: i64,
    },
    CourtCalendar {
        from: NaiveDate,
        to: NaiveDate,
    },

    // classes and enrollments
    CreateClass {
        details: ClassDetails,
    },
    CreateRecurringClasses {
        template: RecurringClass,
        from: NaiveDate,
        to: NaiveDate,
    },
    UpdateClass {
        id: Ulid,
        details: ClassDetails,
    },
    SetClassActive {
        id: Ulid,
        active: bool,
    },
    DeleteClass {
        id: Ulid,
    },
    Enroll {
        /// Defaults to the logged-in member.
        #[serde(default)]
        member_id: Option<Ulid>,
        class_id: Ulid,
    },
    CancelEnrollment {
        id: Ulid,
    },
    SetAttendance {
        id: Ulid,
        attendance: Attendance,
    },
    ClassCalendar {
        from: NaiveDate,
        to: NaiveDate,
    },
    ClassRoster {
        id: Ulid,
    },

    // payments
    RecordPayment {
        member_id: Ulid,
        plan_id: Ulid,
        amount: i64,
        method: PaymentMethod,
        #[serde(default)]
        notes: Option<String>,
        /// Defaults to today.
        #[serde(default)]
        paid_on: Option<NaiveDate>,
        /// Defaults to completed.
        #[serde(default)]
        status: Option<PaymentStatus>,
    },
    UpdatePayment {
        id: Ulid,
        member_id: Ulid,
        plan_id: Ulid,
        amount: i64,
        method: PaymentMethod,
        #[serde(default)]
        notes: Option<String>,
        /// Defaults to the date already on record.
        #[serde(default)]
        paid_on: Option<NaiveDate>,
    },
    SetPaymentStatus {
        id: Ulid,
        status: PaymentStatus,
    },
    DeletePayment {
        id: Ulid,
    },
    ListPayments,
    MemberPayments {
        member_id: Ulid,
    },

    // routines
    CreateRoutineTemplate {
        title: String,
        #[serde(default)]
        description: Option<String>,
        goal: Goal,
        bmi_min: u32,
        bmi_max: u32,
        content: String,
    },
    UpdateRoutineTemplate {
        template: RoutineTemplate,
    },
    DeleteRoutineTemplate {
        id: Ulid,
    },
    ListRoutineTemplates,
    GenerateRoutine {
        member_id: Ulid,
        /// Defaults to the logged-in instructor.
        #[serde(default)]
        instructor_id: Option<Ulid>,
    },
    SetRoutineActive {
        id: Ulid,
        active: bool,
    },
    DeleteRoutine {
        id: Ulid,
    },
    MemberRoutines {
        member_id: Ulid,
    },
    Students {
        /// Defaults to the logged-in instructor.
        #[serde(default)]
        instructor_id: Option<Ulid>,
    },

    /// Stream committed events touching a resource the caller may see.
    Watch {
        resource_id: Ulid,
    },
    Unwatch {
        resource_id: Ulid,
    },
}

impl Request {
    /// Short label for metrics and logs.
    pub fn label(&self) -> &'static str {
        match self {
            Request::Login { .. } => "login",
            Request::RegisterMember { .. } => "register_member",
            Request::UpdateMember { .. } => "update_member",
            Request::SetMemberActive { .. } => "set_member_active",
            Request::DeleteMember { .. } => "delete_member",
            Request::GetMember { .. } => "get_member",
            Request::FindMember { .. } => "find_member",
            Request::ListMembers => "list_members",
            Request::CreatePlan { .. } => "create_plan",
            Request::UpdatePlan { .. } => "update_plan",
            Request::DeletePlan { .. } => "delete_plan",
            Request::ListPlans => "list_plans",
            Request::AssignPlan { .. } => "assign_plan",
            Request::DeactivateSubscription { .. } => "deactivate_subscription",
            Request::Subscriptions { .. } => "subscriptions",
            Request::CurrentPlan { .. } => "current_plan",
            Request::CheckEntitlement { .. } => "check_entitlement",
            Request::RegisterUser { .. } => "register_user",
            Request::DeleteUser { .. } => "delete_user",
            Request::ListUsers => "list_users",
            Request::CreateCourt { .. } => "create_court",
            Request::UpdateCourt { .. } => "update_court",
            Request::SetCourtActive { .. } => "set_court_active",
            Request::DeleteCourt { .. } => "delete_court",
            Request::ListCourts => "list_courts",
            Request::CheckConflict { .. } => "check_conflict",
            Request::SaveBooking { .. } => "save_booking",
            Request::CancelBooking { .. } => "cancel_booking",
            Request::CourtBookings { .. } => "court_bookings",
            Request::CourtAvailability { .. } => "court_availability",
            Request::CourtCalendar { .. } => "court_calendar",
            Request::CreateClass { .. } => "create_class",
            Request::CreateRecurringClasses { .. } => "create_recurring_classes",
            Request::UpdateClass { .. } => "update_class",
            Request::SetClassActive { .. } => "set_class_active",
            Request::DeleteClass { .. } => "delete_class",
            Request::Enroll { .. } => "enroll",
            Request::CancelEnrollment { .. } => "cancel_enrollment",
            Request::SetAttendance { .. } => "set_attendance",
            Request::ClassCalendar { .. } => "class_calendar",
            Request::ClassRoster { .. } => "class_roster",
            Request::RecordPayment { .. } => "record_payment",
            Request::UpdatePayment { .. } => "update_payment",
            Request::SetPaymentStatus { .. } => "set_payment_status",
            Request::DeletePayment { .. } => "delete_payment",
            Request::ListPayments => "list_payments",
            Request::MemberPayments { .. } => "member_payments",
            Request::CreateRoutineTemplate { .. } => "create_routine_template",
            Request::UpdateRoutineTemplate { .. } => "update_routine_template",
            Request::DeleteRoutineTemplate { .. } => "delete_routine_template",
            Request::ListRoutineTemplates => "list_routine_templates",
            Request::GenerateRoutine { .. } => "generate_routine",
            Request::SetRoutineActive { .. } => "set_routine_active",
            Request::DeleteRoutine { .. } => "delete_routine",
            Request::MemberRoutines { .. } => "member_routines",
            Request::Students { .. } => "students",
            Request::Watch { .. } => "watch",
            Request::Unwatch { .. } => "unwatch",
        }
    }
}

#[derive(Debug)]
pub enum ProtocolError {
    /// The line is not a well-formed request.
    Malformed(String),
    /// A request other than `login` arrived before login succeeded.
    NotLoggedIn,
    BadCredentials,
}

impl ProtocolError {
    pub fn kind(&self) -> &'static str {
        match self {
            ProtocolError::Malformed(_) => "protocol",
            ProtocolError::NotLoggedIn => "not_logged_in",
            ProtocolError::BadCredentials => "bad_credentials",
        }
    }
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolError::Malformed(e) => write!(f, "malformed request: {e}"),
            ProtocolError::NotLoggedIn => write!(f, "login required"),
            ProtocolError::BadCredentials => write!(f, "unknown user or wrong password"),
        }
    }
}

impl std::error::Error for ProtocolError {}

pub fn parse_request(line: &str) -> Result<Request, ProtocolError> {
    serde_json::from_str(line).map_err(|e| ProtocolError::Malformed(e.to_string()))
}

#[derive(Debug, Serialize)]
pub struct ErrorBody<'a> {
    pub kind: &'a str,
    pub message: String,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum Reply<'a, T: Serialize> {
    Ok { ok: bool, data: T },
    Err { ok: bool, error: ErrorBody<'a> },
}

pub fn ok_line<T: Serialize>(data: T) -> String {
    serde_json::to_string(&Reply::Ok { ok: true, data })
        .unwrap_or_else(|e| error_line("internal", &e.to_string()))
}

pub fn error_line(kind: &str, message: &str) -> String {
    let reply: Reply<'_, ()> = Reply::Err {
        ok: false,
        error: ErrorBody {
            kind,
            message: message.to_string(),
        },
    };
    serde_json::to_string(&reply).unwrap_or_else(|_| {
        r#"{"ok":false,"error":{"kind":"internal","message":"unencodable error"}}"#.to_string()
    })
}

pub fn engine_error_line(e: &EngineError) -> String {
    error_line(e.kind(), &e.to_string())
}

#[derive(Serialize)]
struct Pushed<'a> {
    event: &'a Event,
}

pub fn event_line(event: &Event) -> String {
    serde_json::to_string(&Pushed { event })
        .unwrap_or_else(|e| error_line("internal", &e.to_string()))
}

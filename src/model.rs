use std::collections::{BTreeMap, HashMap};

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, used for registration timestamps.
pub type Ms = i64;

/// Half-open wall-clock window `[start, end)` within a single day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl TimeRange {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        debug_assert!(start < end, "TimeRange start must be before end");
        Self { start, end }
    }

    /// Like `new`, but returns `None` for empty or inverted windows.
    pub fn try_new(start: NaiveTime, end: NaiveTime) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn is_valid(&self) -> bool {
        self.start < self.end
    }

    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn duration_minutes(&self) -> i64 {
        (self.end - self.start).num_minutes()
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_range(&self, other: &TimeRange) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

// ── Enumerations ─────────────────────────────────────────────────

/// Something a plan may grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    CourtBooking,
    ClassEnrollment,
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Capability::CourtBooking => write!(f, "court booking"),
            Capability::ClassEnrollment => write!(f, "class enrollment"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    SuperAdmin,
    Admin,
    Instructor,
    Member,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CourtKind {
    Basketball,
    Volleyball,
    Futsal,
    Tennis,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentStatus {
    Enrolled,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Attendance {
    Pending,
    Present,
    Absent,
}

/// Training goal a member works towards. Routine templates are keyed by it.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Goal {
    LoseWeight,
    GainMuscle,
    LoseFat,
    #[default]
    Maintain,
    GainStrength,
    Endurance,
    Flexibility,
    SportsPerformance,
    Wellbeing,
    Rehabilitation,
    Toning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Cash,
    Card,
    Transfer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Completed,
    Failed,
}

// ── Entities ─────────────────────────────────────────────────────

/// Personal data of a member, as entered at registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberProfile {
    pub national_id: String,
    pub first_name: String,
    pub last_name: String,
    #[serde(default)]
    pub second_last_name: Option<String>,
    pub email: String,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub birth_date: Option<NaiveDate>,
    #[serde(default)]
    pub fitness: Fitness,
}

impl MemberProfile {
    pub fn display_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }
}

/// Body measurements and goal, plus the instructor in charge of the member's routines.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fitness {
    #[serde(default)]
    pub weight_grams: Option<u32>,
    #[serde(default)]
    pub height_cm: Option<u32>,
    #[serde(default)]
    pub goal: Goal,
    #[serde(default)]
    pub instructor_id: Option<Ulid>,
}

impl Fitness {
    /// Body-mass index in hundredths, rounded half up: `2286` reads as 22.86.
    /// `None` unless both measurements are on record.
    pub fn bmi(&self) -> Option<u32> {
        let grams = u64::from(self.weight_grams?);
        let cm = u64::from(self.height_cm?);
        if grams == 0 || cm == 0 {
            return None;
        }
        let squared = cm * cm;
        u32::try_from((grams * 1000 + squared / 2) / squared).ok()
    }
}

/// Formats a BMI in hundredths as `22.86`.
pub fn format_bmi(bmi: u32) -> String {
    format!("{}.{:02}", bmi / 100, bmi % 100)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub id: Ulid,
    pub profile: MemberProfile,
    pub active: bool,
    pub registered_at: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub id: Ulid,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Price in minor currency units.
    pub price: i64,
    pub duration_days: u32,
    pub may_reserve_courts: bool,
    pub may_reserve_classes: bool,
}

impl Plan {
    pub fn grants(&self, capability: Capability) -> bool {
        match capability {
            Capability::CourtBooking => self.may_reserve_courts,
            Capability::ClassEnrollment => self.may_reserve_classes,
        }
    }
}

/// Time-bounded link between a member and a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: Ulid,
    pub member_id: Ulid,
    pub plan_id: Ulid,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub amount_paid: i64,
    pub active: bool,
}

/// A login identity. Instructors own classes; members link to their member record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Ulid,
    pub national_id: String,
    pub name: String,
    pub role: Role,
    #[serde(default)]
    pub member_id: Option<Ulid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Court {
    pub id: Ulid,
    pub name: String,
    pub kind: CourtKind,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub member_id: Ulid,
    pub court_id: Ulid,
    pub date: NaiveDate,
    pub range: TimeRange,
    pub status: BookingStatus,
    pub registered_at: Ms,
}

impl Booking {
    pub fn is_live(&self) -> bool {
        self.status != BookingStatus::Cancelled
    }
}

/// Everything needed to schedule a class on one day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassDetails {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub instructor_id: Ulid,
    pub date: NaiveDate,
    pub range: TimeRange,
    pub capacity: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Class {
    pub id: Ulid,
    pub name: String,
    pub description: Option<String>,
    pub instructor_id: Ulid,
    pub date: NaiveDate,
    pub range: TimeRange,
    pub capacity: u32,
    pub active: bool,
}

impl Class {
    pub fn from_details(id: Ulid, details: ClassDetails) -> Self {
        Self {
            id,
            name: details.name,
            description: details.description,
            instructor_id: details.instructor_id,
            date: details.date,
            range: details.range,
            capacity: details.capacity,
            active: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Enrollment {
    pub id: Ulid,
    pub member_id: Ulid,
    pub class_id: Ulid,
    pub status: EnrollmentStatus,
    pub attendance: Attendance,
    pub registered_at: Ms,
}

/// What staff enter when recording or editing a payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentDetails {
    pub member_id: Ulid,
    pub plan_id: Ulid,
    /// Minor currency units.
    pub amount: i64,
    pub method: PaymentMethod,
    #[serde(default)]
    pub notes: Option<String>,
    pub paid_on: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    pub id: Ulid,
    pub member_id: Ulid,
    pub plan_id: Ulid,
    /// The member's active assignment of `plan_id` when the payment was taken, if any.
    pub subscription_id: Option<Ulid>,
    pub paid_on: NaiveDate,
    pub amount: i64,
    pub method: PaymentMethod,
    pub notes: Option<String>,
    pub status: PaymentStatus,
}

/// A reusable routine, offered to members whose goal matches and whose BMI
/// falls in `[bmi_min, bmi_max]` (hundredths, both ends inclusive).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutineTemplate {
    pub id: Ulid,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    pub goal: Goal,
    pub bmi_min: u32,
    pub bmi_max: u32,
    pub content: String,
}

/// A routine handed to one member by one instructor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Routine {
    pub id: Ulid,
    pub instructor_id: Ulid,
    pub member_id: Ulid,
    pub title: String,
    pub description: Option<String>,
    pub content: String,
    /// The member's BMI when the routine was generated.
    pub bmi: u32,
    pub assigned_at: NaiveDateTime,
    pub active: bool,
}

// ── Schedules ────────────────────────────────────────────────────

/// One occupied window on a schedule: a live booking or an active class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub id: Ulid,
    pub range: TimeRange,
}

/// Occupied windows per date, each day sorted by `range.start`.
#[derive(Debug, Clone, Default)]
pub struct Schedule {
    days: BTreeMap<NaiveDate, Vec<Slot>>,
}

impl Schedule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert slot maintaining sort order by start time.
    pub fn insert(&mut self, date: NaiveDate, slot: Slot) {
        let day = self.days.entry(date).or_default();
        let pos = day
            .binary_search_by_key(&slot.range.start, |s| s.range.start)
            .unwrap_or_else(|e| e);
        day.insert(pos, slot);
    }

    /// Remove slot by id. Empty days are dropped.
    pub fn remove(&mut self, date: NaiveDate, id: Ulid) -> Option<Slot> {
        let day = self.days.get_mut(&date)?;
        let pos = day.iter().position(|s| s.id == id)?;
        let slot = day.remove(pos);
        if day.is_empty() {
            self.days.remove(&date);
        }
        Some(slot)
    }

    /// Remove slot by id wherever it sits.
    pub fn remove_id(&mut self, id: Ulid) -> Option<Slot> {
        let date = self
            .days
            .iter()
            .find(|(_, slots)| slots.iter().any(|s| s.id == id))
            .map(|(date, _)| *date)?;
        self.remove(date, id)
    }

    pub fn day(&self, date: NaiveDate) -> &[Slot] {
        self.days.get(&date).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Slots on `date` whose window overlaps `query`.
    /// Binary search skips slots starting at or after `query.end`.
    pub fn overlapping(&self, date: NaiveDate, query: &TimeRange) -> impl Iterator<Item = &Slot> {
        let day = self.day(date);
        let right_bound = day.partition_point(|s| s.range.start < query.end);
        day[..right_bound]
            .iter()
            .filter(move |s| s.range.end > query.start)
    }

    pub fn is_empty(&self) -> bool {
        self.days.is_empty()
    }

    pub fn len(&self) -> usize {
        self.days.values().map(Vec::len).sum()
    }
}

// ── Per-resource state ───────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct MemberState {
    pub member: Member,
    /// In assignment order.
    pub subscriptions: Vec<Subscription>,
    pub payments: HashMap<Ulid, Payment>,
    pub routines: HashMap<Ulid, Routine>,
}

impl MemberState {
    pub fn new(member: Member) -> Self {
        Self {
            member,
            subscriptions: Vec::new(),
            payments: HashMap::new(),
            routines: HashMap::new(),
        }
    }

    /// The active assignment with the furthest end date. Among equal end dates the
    /// most recently assigned wins. End dates in the past are NOT filtered out.
    pub fn entitling_subscription(&self) -> Option<&Subscription> {
        self.subscriptions
            .iter()
            .filter(|s| s.active)
            .max_by_key(|s| s.end_date)
    }

    /// Like `entitling_subscription`, but ignores assignments that ended before `today`.
    pub fn current_subscription(&self, today: NaiveDate) -> Option<&Subscription> {
        self.subscriptions
            .iter()
            .filter(|s| s.active && s.end_date >= today)
            .max_by_key(|s| s.end_date)
    }
}

#[derive(Debug, Clone)]
pub struct CourtState {
    pub court: Court,
    /// All bookings ever made on this court, cancelled ones included.
    pub bookings: HashMap<Ulid, Booking>,
    /// Live (non-cancelled) bookings only.
    pub schedule: Schedule,
}

impl CourtState {
    pub fn new(court: Court) -> Self {
        Self {
            court,
            bookings: HashMap::new(),
            schedule: Schedule::new(),
        }
    }

    /// Place a booking, replacing any previous version with the same id.
    pub fn upsert_booking(&mut self, booking: Booking) {
        if let Some(previous) = self.bookings.remove(&booking.id) {
            self.schedule.remove(previous.date, previous.id);
        }
        if booking.is_live() {
            self.schedule.insert(
                booking.date,
                Slot {
                    id: booking.id,
                    range: booking.range,
                },
            );
        }
        self.bookings.insert(booking.id, booking);
    }

    pub fn remove_booking(&mut self, id: Ulid) -> Option<Booking> {
        let booking = self.bookings.remove(&id)?;
        self.schedule.remove(booking.date, id);
        Some(booking)
    }

    /// Storage-level uniqueness on (court, date, start) among live bookings.
    pub fn start_taken(&self, date: NaiveDate, start: NaiveTime, exclude: Option<Ulid>) -> bool {
        self.schedule
            .day(date)
            .iter()
            .any(|s| s.range.start == start && Some(s.id) != exclude)
    }
}

#[derive(Debug, Clone)]
pub struct ClassState {
    pub class: Class,
    /// Keyed by member id: one enrollment record per (member, class).
    pub enrollments: HashMap<Ulid, Enrollment>,
}

impl ClassState {
    pub fn new(class: Class) -> Self {
        Self {
            class,
            enrollments: HashMap::new(),
        }
    }

    pub fn enrolled_count(&self) -> u32 {
        self.enrollments
            .values()
            .filter(|e| e.status == EnrollmentStatus::Enrolled)
            .count() as u32
    }

    pub fn seats_left(&self) -> u32 {
        self.class.capacity.saturating_sub(self.enrolled_count())
    }

    pub fn enrollment(&self, id: Ulid) -> Option<&Enrollment> {
        self.enrollments.values().find(|e| e.id == id)
    }
}

// ── Log records ──────────────────────────────────────────────────

/// The event types: flat, no nesting of events. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    MemberRegistered {
        member: Member,
    },
    MemberUpdated {
        id: Ulid,
        profile: MemberProfile,
    },
    MemberStatusChanged {
        id: Ulid,
        active: bool,
    },
    /// Removes the member together with every record that points at it.
    MemberDeleted {
        id: Ulid,
        cascade: MemberCascade,
    },
    PlanCreated {
        plan: Plan,
    },
    PlanUpdated {
        plan: Plan,
    },
    PlanDeleted {
        id: Ulid,
    },
    /// `deactivated` lists the member's previously active assignments this one replaces.
    SubscriptionAssigned {
        subscription: Subscription,
        deactivated: Vec<Ulid>,
    },
    SubscriptionDeactivated {
        id: Ulid,
        member_id: Ulid,
    },
    UserRegistered {
        user: User,
    },
    UserDeleted {
        id: Ulid,
    },
    CourtCreated {
        court: Court,
    },
    CourtUpdated {
        court: Court,
    },
    CourtDeleted {
        id: Ulid,
    },
    /// Insert or replace. `moved_from` is set when an edit moved the booking off another court.
    BookingSaved {
        booking: Booking,
        moved_from: Option<Ulid>,
    },
    BookingCancelled {
        id: Ulid,
        court_id: Ulid,
    },
    ClassCreated {
        class: Class,
    },
    /// A recurring series, committed as one record.
    ClassesCreated {
        classes: Vec<Class>,
    },
    /// `previous_instructor` is set when the edit reassigned the class.
    ClassUpdated {
        class: Class,
        previous_instructor: Option<Ulid>,
    },
    ClassDeleted {
        id: Ulid,
        instructor_id: Ulid,
    },
    /// Insert or replace the (member, class) enrollment record.
    EnrollmentSaved {
        enrollment: Enrollment,
    },
    /// Insert or replace. `moved_from` is set when an edit moved the payment off another member.
    PaymentSaved {
        payment: Payment,
        moved_from: Option<Ulid>,
    },
    PaymentRemoved {
        id: Ulid,
        member_id: Ulid,
    },
    TemplateSaved {
        template: RoutineTemplate,
    },
    TemplateDeleted {
        id: Ulid,
    },
    RoutineSaved {
        routine: Routine,
    },
    RoutineRemoved {
        id: Ulid,
        member_id: Ulid,
        instructor_id: Ulid,
    },
}

/// Records removed along with a member.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberCascade {
    /// `(court_id, booking_id)`
    pub bookings: Vec<(Ulid, Ulid)>,
    /// `(class_id, enrollment_id)`
    pub enrollments: Vec<(Ulid, Ulid)>,
    /// Logins linked to the member.
    pub logins: Vec<Ulid>,
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlanSummary {
    pub plan_id: Ulid,
    pub plan_name: String,
    pub valid_until: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CourtEvent {
    pub booking_id: Ulid,
    pub court_id: Ulid,
    pub court_name: String,
    pub member_id: Ulid,
    pub member_name: String,
    pub date: NaiveDate,
    pub range: TimeRange,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClassEvent {
    pub class_id: Ulid,
    pub name: String,
    pub instructor_id: Ulid,
    pub instructor_name: String,
    pub date: NaiveDate,
    pub range: TimeRange,
    pub capacity: u32,
    pub enrolled: u32,
    pub seats_left: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RosterEntry {
    pub enrollment_id: Ulid,
    pub member_id: Ulid,
    pub member_name: String,
    pub attendance: Attendance,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClassRoster {
    pub class: Class,
    pub enrolled: u32,
    pub seats_left: u32,
    pub students: Vec<RosterEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PaymentEntry {
    pub payment: Payment,
    pub member_name: String,
    pub plan_name: String,
}

/// A member assigned to an instructor, with what routine matching needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Student {
    pub member_id: Ulid,
    pub name: String,
    pub goal: Goal,
    pub bmi: Option<u32>,
}

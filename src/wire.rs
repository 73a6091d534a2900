use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::access::{authorize, Action, Actor, WatchTarget};
use crate::engine::{Engine, EngineError};
use crate::limits::{MAX_LINE_LEN, MAX_WATCHES_PER_CONNECTION};
use crate::model::*;
use crate::observability::*;
use crate::protocol::{
    engine_error_line, error_line, event_line, ok_line, parse_request, ProtocolError, Request,
};

/// What to do after answering a line.
enum Flow {
    Continue,
    Close,
}

/// Per-connection state: who is logged in and which resources they watch.
struct Session {
    engine: Arc<Engine>,
    password: String,
    actor: Option<Actor>,
    watches: HashMap<Ulid, JoinHandle<()>>,
    events_tx: mpsc::Sender<Event>,
}

impl Drop for Session {
    fn drop(&mut self) {
        for (_, task) in self.watches.drain() {
            task.abort();
        }
    }
}

/// Serve one client: newline-delimited JSON requests in, one reply line per
/// request out, interleaved with pushed events for watched resources.
pub async fn process_connection(
    socket: TcpStream,
    engine: Arc<Engine>,
    password: String,
) -> Result<(), LinesCodecError> {
    let (mut sink, mut lines) =
        Framed::new(socket, LinesCodec::new_with_max_length(MAX_LINE_LEN)).split();
    let (events_tx, mut events_rx) = mpsc::channel(256);
    let mut session = Session {
        engine,
        password,
        actor: None,
        watches: HashMap::new(),
        events_tx,
    };

    loop {
        tokio::select! {
            line = lines.next() => {
                let Some(line) = line else { break };
                let line = match line {
                    Ok(line) => line,
                    Err(LinesCodecError::MaxLineLengthExceeded) => {
                        sink.send(error_line("protocol", "request line too long")).await?;
                        break;
                    }
                    Err(e) => return Err(e),
                };
                if line.trim().is_empty() {
                    continue;
                }
                let (reply, flow) = session.handle_line(&line).await;
                sink.send(reply).await?;
                if let Flow::Close = flow {
                    break;
                }
            }
            Some(event) = events_rx.recv() => {
                sink.send(event_line(&event)).await?;
            }
        }
    }
    Ok(())
}

impl Session {
    async fn handle_line(&mut self, line: &str) -> (String, Flow) {
        let request = match parse_request(line) {
            Ok(r) => r,
            Err(e) => return (error_line(e.kind(), &e.to_string()), Flow::Continue),
        };
        let op = request.label();
        let start = Instant::now();

        let result = match (self.actor.clone(), request) {
            (None, Request::Login { user_id, password }) => self.login(user_id, &password),
            (Some(_), Request::Login { .. }) => Err(Failure::Protocol(ProtocolError::Malformed(
                "already logged in".into(),
            ))),
            (None, _) => Err(Failure::Protocol(ProtocolError::NotLoggedIn)),
            (Some(actor), request) => match request {
                Request::Watch { resource_id } => watch_target(&self.engine, resource_id)
                    .and_then(|target| authorize(&actor, &Action::Watch(target)))
                    .and_then(|()| self.watch(resource_id))
                    .map_err(Failure::Engine),
                Request::Unwatch { resource_id } => {
                    if let Some(task) = self.watches.remove(&resource_id) {
                        task.abort();
                    }
                    Ok(ok_line(resource_id))
                }
                request => execute(&self.engine, &actor, request)
                    .await
                    .map_err(Failure::Engine),
            },
        };

        let (line, flow, status) = match result {
            Ok(line) => (line, Flow::Continue, "ok"),
            Err(Failure::Engine(e)) => {
                metrics::counter!(REJECTIONS_TOTAL, "kind" => e.kind()).increment(1);
                if e.is_fatal() {
                    warn!("{op} failed: {e}");
                } else {
                    debug!("{op} rejected: {e}");
                }
                (engine_error_line(&e), Flow::Continue, "error")
            }
            Err(Failure::Protocol(e)) => {
                let flow = match e {
                    ProtocolError::BadCredentials => Flow::Close,
                    _ => Flow::Continue,
                };
                (error_line(e.kind(), &e.to_string()), flow, "error")
            }
        };
        metrics::counter!(REQUESTS_TOTAL, "op" => op, "status" => status).increment(1);
        metrics::histogram!(REQUEST_DURATION_SECONDS, "op" => op)
            .record(start.elapsed().as_secs_f64());
        (line, flow)
    }

    fn login(&mut self, user_id: Ulid, password: &str) -> Result<String, Failure> {
        let user = match self.engine.get_user(user_id) {
            Ok(user) if password == self.password => user,
            _ => {
                metrics::counter!(AUTH_FAILURES_TOTAL).increment(1);
                warn!("failed login for user {user_id}");
                return Err(Failure::Protocol(ProtocolError::BadCredentials));
            }
        };
        info!("user {} logged in as {:?}", user.id, user.role);
        let actor = Actor::from(&user);
        self.actor = Some(actor);
        Ok(ok_line(&user))
    }

    fn watch(&mut self, resource_id: Ulid) -> Result<String, EngineError> {
        if self.watches.contains_key(&resource_id) {
            return Ok(ok_line(resource_id));
        }
        if self.watches.len() >= MAX_WATCHES_PER_CONNECTION {
            return Err(EngineError::LimitExceeded("too many watches on this connection"));
        }
        let mut rx = self.engine.notify.subscribe(resource_id);
        let tx = self.events_tx.clone();
        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("watcher of {resource_id} skipped {n} events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        self.watches.insert(resource_id, task);
        Ok(ok_line(resource_id))
    }
}

enum Failure {
    Engine(EngineError),
    Protocol(ProtocolError),
}

/// The member a request acts for: the one named, or the caller's own record.
fn member_for(actor: &Actor, named: Option<Ulid>) -> Result<Ulid, EngineError> {
    named
        .or(actor.member_id)
        .ok_or_else(|| EngineError::InvalidInput("member_id is required".into()))
}

async fn instructor_of_class(engine: &Engine, class_id: Ulid) -> Result<Ulid, EngineError> {
    Ok(engine.get_class(class_id).await?.instructor_id)
}

/// The instructor a request acts for: the one named, or the caller.
fn instructor_for(actor: &Actor, named: Option<Ulid>) -> Ulid {
    named.unwrap_or(actor.user_id)
}

/// What a watched id refers to, so watching follows the same rules as viewing.
fn watch_target(engine: &Engine, id: Ulid) -> Result<WatchTarget, EngineError> {
    if engine.get_court_state(&id).is_some()
        || engine.get_class_state(&id).is_some()
        || engine.get_plan(id).is_ok()
        || engine.get_routine_template(id).is_ok()
    {
        return Ok(WatchTarget::Public);
    }
    if engine.get_member_state(&id).is_some() {
        return Ok(WatchTarget::Member(id));
    }
    match engine.get_user(id)?.role {
        Role::Instructor => Ok(WatchTarget::Instructor(id)),
        _ => Ok(WatchTarget::User),
    }
}

async fn view_routines(engine: &Engine, member_id: Ulid) -> Result<Action, EngineError> {
    let coach = engine.get_member(member_id).await?.profile.fitness.instructor_id;
    Ok(Action::ViewRoutines { member_id, coach })
}

/// Authorize and run one request against the engine, producing the reply line.
async fn execute(engine: &Engine, actor: &Actor, request: Request) -> Result<String, EngineError> {
    let line = match request {
        Request::Login { .. } | Request::Watch { .. } | Request::Unwatch { .. } => {
            return Err(EngineError::InvalidInput("handled by the session".into()));
        }

        // ── members ──
        Request::RegisterMember { profile } => {
            authorize(actor, &Action::ManageMembers)?;
            ok_line(engine.register_member(Ulid::new(), profile).await?)
        }
        Request::UpdateMember { id, profile } => {
            authorize(actor, &Action::ManageMembers)?;
            ok_line(engine.update_member(id, profile).await?)
        }
        Request::SetMemberActive { id, active } => {
            authorize(actor, &Action::ManageMembers)?;
            ok_line(engine.set_member_active(id, active).await?)
        }
        Request::DeleteMember { id } => {
            authorize(actor, &Action::ManageMembers)?;
            engine.delete_member(id).await?;
            ok_line(id)
        }
        Request::GetMember { id } => {
            authorize(actor, &Action::ViewMember { member_id: id })?;
            ok_line(engine.get_member(id).await?)
        }
        Request::FindMember { national_id } => {
            authorize(actor, &Action::ManageMembers)?;
            ok_line(engine.find_member_by_national_id(&national_id).await)
        }
        Request::ListMembers => {
            authorize(actor, &Action::ManageMembers)?;
            ok_line(engine.list_members().await)
        }

        // ── plans ──
        Request::CreatePlan {
            name,
            description,
            price,
            duration_days,
            may_reserve_courts,
            may_reserve_classes,
        } => {
            authorize(actor, &Action::ManagePlans)?;
            let plan = Plan {
                id: Ulid::new(),
                name,
                description,
                price,
                duration_days,
                may_reserve_courts,
                may_reserve_classes,
            };
            ok_line(engine.create_plan(plan).await?)
        }
        Request::UpdatePlan { plan } => {
            authorize(actor, &Action::ManagePlans)?;
            ok_line(engine.update_plan(plan).await?)
        }
        Request::DeletePlan { id } => {
            authorize(actor, &Action::ManagePlans)?;
            engine.delete_plan(id).await?;
            ok_line(id)
        }
        Request::ListPlans => {
            authorize(actor, &Action::ViewPlans)?;
            ok_line(engine.list_plans())
        }
        Request::AssignPlan {
            member_id,
            plan_id,
            start_date,
            amount_paid,
        } => {
            authorize(actor, &Action::ManageMembers)?;
            ok_line(engine.assign_plan(member_id, plan_id, start_date, amount_paid).await?)
        }
        Request::DeactivateSubscription { id } => {
            authorize(actor, &Action::ManageMembers)?;
            ok_line(engine.deactivate_subscription(id).await?)
        }
        Request::Subscriptions { member_id } => {
            authorize(actor, &Action::ViewMember { member_id })?;
            ok_line(engine.subscriptions_of(member_id).await?)
        }
        Request::CurrentPlan { member_id, today } => {
            authorize(actor, &Action::ViewMember { member_id })?;
            let today = today.unwrap_or_else(|| chrono::Local::now().date_naive());
            ok_line(engine.current_plan(member_id, today).await?)
        }
        Request::CheckEntitlement {
            member_id,
            capability,
        } => {
            authorize(actor, &Action::ViewMember { member_id })?;
            ok_line(engine.resolve_entitlement(member_id, capability).await?)
        }

        // ── users ──
        Request::RegisterUser {
            national_id,
            name,
            role,
            member_id,
        } => {
            authorize(actor, &Action::ManageUsers { role })?;
            let user = User {
                id: Ulid::new(),
                national_id,
                name,
                role,
                member_id,
            };
            ok_line(engine.register_user(user).await?)
        }
        Request::DeleteUser { id } => {
            let role = engine.get_user(id)?.role;
            authorize(actor, &Action::ManageUsers { role })?;
            engine.delete_user(id).await?;
            ok_line(id)
        }
        Request::ListUsers => {
            authorize(actor, &Action::ViewUsers)?;
            ok_line(engine.list_users())
        }

        // ── courts and bookings ──
        Request::CreateCourt { name, kind } => {
            authorize(actor, &Action::ManageCourts)?;
            ok_line(engine.create_court(Ulid::new(), name, kind).await?)
        }
        Request::UpdateCourt { id, name, kind } => {
            authorize(actor, &Action::ManageCourts)?;
            ok_line(engine.update_court(id, name, kind).await?)
        }
        Request::SetCourtActive { id, active } => {
            authorize(actor, &Action::ManageCourts)?;
            ok_line(engine.set_court_active(id, active).await?)
        }
        Request::DeleteCourt { id } => {
            authorize(actor, &Action::ManageCourts)?;
            engine.delete_court(id).await?;
            ok_line(id)
        }
        Request::ListCourts => {
            authorize(actor, &Action::ViewSchedules)?;
            ok_line(engine.list_courts().await)
        }
        Request::CheckConflict {
            key,
            date,
            range,
            exclude,
        } => {
            authorize(actor, &Action::ViewSchedules)?;
            ok_line(engine.has_conflict(key, date, range, exclude).await?)
        }
        Request::SaveBooking {
            member_id,
            court_id,
            date,
            range,
            booking_id,
        } => {
            let member_id = member_for(actor, member_id)?;
            authorize(actor, &Action::Book { member_id })?;
            if let Some(id) = booking_id {
                let current = engine.get_booking(id).await?;
                authorize(actor, &Action::Book { member_id: current.member_id })?;
            }
            let booking = engine
                .create_or_update_booking(member_id, court_id, date, range, booking_id)
                .await?;
            ok_line(booking)
        }
        Request::CancelBooking { id } => {
            let current = engine.get_booking(id).await?;
            authorize(actor, &Action::Book { member_id: current.member_id })?;
            ok_line(engine.cancel_booking(id).await?)
        }
        Request::CourtBookings { court_id, date } => {
            authorize(actor, &Action::ViewSchedules)?;
            ok_line(engine.bookings_of(court_id, date).await?)
        }
        Request::CourtAvailability {
            court_id,
            date,
            opening,
            min_minutes,
        } => {
            authorize(actor, &Action::ViewSchedules)?;
            ok_line(engine.court_availability(court_id, date, opening, min_minutes).await?)
        }
        Request::CourtCalendar { from, to } => {
            authorize(actor, &Action::ViewSchedules)?;
            ok_line(engine.court_calendar(from, to).await?)
        }

        // ── classes and enrollments ──
        Request::CreateClass { details } => {
            authorize(actor, &Action::ManageClass { instructor_id: details.instructor_id })?;
            ok_line(engine.create_class(details).await?)
        }
        Request::CreateRecurringClasses { template, from, to } => {
            authorize(actor, &Action::ManageClass { instructor_id: template.instructor_id })?;
            ok_line(engine.create_recurring_classes(template, from, to).await?)
        }
        Request::UpdateClass { id, details } => {
            let instructor_id = instructor_of_class(engine, id).await?;
            authorize(actor, &Action::ManageClass { instructor_id })?;
            authorize(actor, &Action::ManageClass { instructor_id: details.instructor_id })?;
            ok_line(engine.update_class(id, details).await?)
        }
        Request::SetClassActive { id, active } => {
            let instructor_id = instructor_of_class(engine, id).await?;
            authorize(actor, &Action::ManageClass { instructor_id })?;
            ok_line(engine.set_class_active(id, active).await?)
        }
        Request::DeleteClass { id } => {
            let instructor_id = instructor_of_class(engine, id).await?;
            authorize(actor, &Action::ManageClass { instructor_id })?;
            engine.delete_class(id).await?;
            ok_line(id)
        }
        Request::Enroll {
            member_id,
            class_id,
        } => {
            let member_id = member_for(actor, member_id)?;
            let instructor_id = instructor_of_class(engine, class_id).await?;
            authorize(actor, &Action::Enroll { member_id, instructor_id })?;
            ok_line(engine.enroll_member(member_id, class_id).await?)
        }
        Request::CancelEnrollment { id } => {
            let enrollment = engine.get_enrollment(id).await?;
            let instructor_id = instructor_of_class(engine, enrollment.class_id).await?;
            authorize(
                actor,
                &Action::Enroll {
                    member_id: enrollment.member_id,
                    instructor_id,
                },
            )?;
            ok_line(engine.cancel_enrollment(id).await?)
        }
        Request::SetAttendance { id, attendance } => {
            let enrollment = engine.get_enrollment(id).await?;
            let instructor_id = instructor_of_class(engine, enrollment.class_id).await?;
            authorize(actor, &Action::ManageClass { instructor_id })?;
            ok_line(engine.set_attendance(id, attendance).await?)
        }
        Request::ClassCalendar { from, to } => {
            authorize(actor, &Action::ViewSchedules)?;
            ok_line(engine.class_calendar(from, to).await?)
        }
        Request::ClassRoster { id } => {
            let instructor_id = instructor_of_class(engine, id).await?;
            authorize(actor, &Action::ViewRoster { instructor_id })?;
            ok_line(engine.class_roster(id).await?)
        }

        // ── payments ──
        Request::RecordPayment {
            member_id,
            plan_id,
            amount,
            method,
            notes,
            paid_on,
            status,
        } => {
            authorize(actor, &Action::ManagePayments)?;
            let details = PaymentDetails {
                member_id,
                plan_id,
                amount,
                method,
                notes,
                paid_on: paid_on.unwrap_or_else(|| chrono::Local::now().date_naive()),
            };
            let status = status.unwrap_or(PaymentStatus::Completed);
            ok_line(engine.record_payment(details, status).await?)
        }
        Request::UpdatePayment {
            id,
            member_id,
            plan_id,
            amount,
            method,
            notes,
            paid_on,
        } => {
            authorize(actor, &Action::ManagePayments)?;
            let paid_on = match paid_on {
                Some(date) => date,
                None => engine.get_payment(id).await?.paid_on,
            };
            let details = PaymentDetails {
                member_id,
                plan_id,
                amount,
                method,
                notes,
                paid_on,
            };
            ok_line(engine.update_payment(id, details).await?)
        }
        Request::SetPaymentStatus { id, status } => {
            authorize(actor, &Action::ManagePayments)?;
            ok_line(engine.set_payment_status(id, status).await?)
        }
        Request::DeletePayment { id } => {
            authorize(actor, &Action::ManagePayments)?;
            engine.delete_payment(id).await?;
            ok_line(id)
        }
        Request::ListPayments => {
            authorize(actor, &Action::ManagePayments)?;
            ok_line(engine.list_payments().await)
        }
        Request::MemberPayments { member_id } => {
            authorize(actor, &Action::ViewMember { member_id })?;
            ok_line(engine.payments_of(member_id).await?)
        }

        // ── routines ──
        Request::CreateRoutineTemplate {
            title,
            description,
            goal,
            bmi_min,
            bmi_max,
            content,
        } => {
            authorize(actor, &Action::ManageRoutineTemplates)?;
            let template = RoutineTemplate {
                id: Ulid::new(),
                title,
                description,
                goal,
                bmi_min,
                bmi_max,
                content,
            };
            ok_line(engine.create_routine_template(template).await?)
        }
        Request::UpdateRoutineTemplate { template } => {
            authorize(actor, &Action::ManageRoutineTemplates)?;
            ok_line(engine.update_routine_template(template).await?)
        }
        Request::DeleteRoutineTemplate { id } => {
            authorize(actor, &Action::ManageRoutineTemplates)?;
            engine.delete_routine_template(id).await?;
            ok_line(id)
        }
        Request::ListRoutineTemplates => {
            authorize(actor, &Action::ManageRoutineTemplates)?;
            ok_line(engine.list_routine_templates())
        }
        Request::GenerateRoutine {
            member_id,
            instructor_id,
        } => {
            let instructor_id = instructor_for(actor, instructor_id);
            authorize(actor, &Action::ManageRoutine { instructor_id })?;
            let now = chrono::Local::now().naive_local();
            ok_line(engine.generate_routine(instructor_id, member_id, now).await?)
        }
        Request::SetRoutineActive { id, active } => {
            let instructor_id = engine.get_routine(id).await?.instructor_id;
            authorize(actor, &Action::ManageRoutine { instructor_id })?;
            ok_line(engine.set_routine_active(id, active).await?)
        }
        Request::DeleteRoutine { id } => {
            let instructor_id = engine.get_routine(id).await?.instructor_id;
            authorize(actor, &Action::ManageRoutine { instructor_id })?;
            engine.delete_routine(id).await?;
            ok_line(id)
        }
        Request::MemberRoutines { member_id } => {
            authorize(actor, &view_routines(engine, member_id).await?)?;
            ok_line(engine.routines_of(member_id).await?)
        }
        Request::Students { instructor_id } => {
            let instructor_id = instructor_for(actor, instructor_id);
            authorize(actor, &Action::ViewStudents { instructor_id })?;
            ok_line(engine.students_of(instructor_id).await?)
        }
    };
    Ok(line)
}

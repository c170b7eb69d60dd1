//! Newline-delimited JSON over TCP.
//!
//! Each request is one line: `{"token": "...", "op": "<op>", ...fields}`.
//! Each reply is one line: `{"ok": true, "result": ...}` or
//! `{"ok": false, "error": {"code", "class", "retryable", "message"}}`.
//! After `subscribe`, the member's notifications are pushed on the same
//! connection as `{"notification": {...}}` lines.

use std::io;
use std::sync::Arc;

use chrono::{NaiveDate, NaiveTime};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use ulid::Ulid;

use crate::engine::{Engine, EngineError, ErrorClass, TrainerUpdate};
use crate::limits::MAX_REQUEST_BYTES;
use crate::model::*;
use crate::notify::{Notification, NotifyHub};

/// Shared by every connection.
pub struct ServerContext {
    pub engine: Arc<Engine>,
    /// Source of pushed notifications; `subscribe` is refused without one.
    pub hub: Option<Arc<NotifyHub>>,
    pub admin_token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    // ── Member operations ────────────────────────────────────
    BookClass {
        occurrence_id: Ulid,
        category: ClassCategory,
        #[serde(default)]
        notes: Option<String>,
    },
    CancelClassReservation {
        reservation_id: Ulid,
        #[serde(default)]
        reason: Option<String>,
    },
    BookTrainerAppointment {
        trainer_id: Ulid,
        date: NaiveDate,
        start: NaiveTime,
        end: NaiveTime,
        category: TrainerCategory,
        location: String,
        #[serde(default)]
        focus: Option<String>,
    },
    CancelTrainerAppointment {
        appointment_id: Ulid,
        #[serde(default)]
        reason: Option<String>,
    },
    MyReservations,
    Subscribe,

    // ── Lookups (any authenticated member) ──────────────────
    Occurrence {
        id: Ulid,
    },
    UpcomingOccurrences {
        from: Ms,
        to: Ms,
    },
    Waitlist {
        occurrence_id: Ulid,
    },
    Reservation {
        id: Ulid,
    },
    Appointment {
        id: Ulid,
    },
    Trainer {
        id: Ulid,
    },
    TrainerSlots {
        trainer_id: Ulid,
    },

    // ── Admin operations ─────────────────────────────────────
    ScheduleOccurrence(ScheduleOccurrence),
    CancelOccurrence {
        occurrence_id: Ulid,
        #[serde(default)]
        reason: Option<String>,
    },
    CompleteOccurrence {
        occurrence_id: Ulid,
    },
    RegisterTrainer(NewTrainer),
    UpdateTrainer {
        trainer_id: Ulid,
        #[serde(flatten)]
        update: TrainerUpdate,
    },
    OpenTrainerSlot {
        trainer_id: Ulid,
        date: NaiveDate,
        start: NaiveTime,
        end: NaiveTime,
    },
    PendingRefunds,
    RetryPendingRefunds,
}

impl Request {
    pub fn is_admin(&self) -> bool {
        matches!(
            self,
            Request::ScheduleOccurrence(_)
                | Request::CancelOccurrence { .. }
                | Request::CompleteOccurrence { .. }
                | Request::RegisterTrainer(_)
                | Request::UpdateTrainer { .. }
                | Request::OpenTrainerSlot { .. }
                | Request::PendingRefunds
                | Request::RetryPendingRefunds
        )
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    token: String,
    #[serde(flatten)]
    request: Request,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WireError {
    pub code: &'static str,
    pub class: ErrorClass,
    pub retryable: bool,
    pub message: String,
}

impl From<&EngineError> for WireError {
    fn from(err: &EngineError) -> Self {
        Self {
            code: err.code(),
            class: err.class(),
            retryable: err.is_retryable(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum Reply {
    Ok { ok: bool, result: Value },
    Err { ok: bool, error: WireError },
    Push { notification: Notification },
}

impl Reply {
    fn ok(result: Value) -> Self {
        Reply::Ok { ok: true, result }
    }

    fn err(err: &EngineError) -> Self {
        Reply::Err {
            ok: false,
            error: err.into(),
        }
    }

    fn to_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| internal_error_line(&e.to_string()))
    }
}

/// Reply line for a result that could not itself be serialized.
fn internal_error_line(message: &str) -> String {
    json!({
        "ok": false,
        "error": {
            "code": "Internal",
            "class": "transient",
            "retryable": true,
            "message": message,
        },
    })
    .to_string()
}

fn to_value<T: Serialize>(value: T) -> Result<Value, EngineError> {
    serde_json::to_value(value).map_err(|e| EngineError::Storage(e.to_string()))
}

/// Outcome of one request line.
struct Handled {
    reply: Reply,
    subscribe: Option<broadcast::Receiver<Notification>>,
}

impl Handled {
    fn reply(result: Result<Value, EngineError>) -> Self {
        let reply = match result {
            Ok(v) => Reply::ok(v),
            Err(e) => Reply::err(&e),
        };
        Self {
            reply,
            subscribe: None,
        }
    }
}

async fn handle_line(ctx: &ServerContext, line: &str) -> Handled {
    let envelope: Envelope = match serde_json::from_str(line) {
        Ok(e) => e,
        Err(e) => {
            return Handled::reply(Err(EngineError::InvalidInput(format!(
                "malformed request: {e}"
            ))));
        }
    };
    let request = envelope.request;

    if request.is_admin() {
        if ctx.admin_token.is_empty() || envelope.token != ctx.admin_token {
            return Handled::reply(Err(EngineError::Unauthenticated));
        }
        return Handled::reply(execute_admin(&ctx.engine, request).await);
    }

    let member_id = match ctx.engine.authenticate(&envelope.token).await {
        Ok(id) => id,
        Err(e) => return Handled::reply(Err(e)),
    };

    if request == Request::Subscribe {
        return match &ctx.hub {
            Some(hub) => Handled {
                reply: Reply::ok(json!({ "member_id": member_id })),
                subscribe: Some(hub.subscribe(member_id)),
            },
            None => Handled::reply(Err(EngineError::InvalidInput(
                "notifications are not available".into(),
            ))),
        };
    }
    Handled::reply(execute_member(&ctx.engine, member_id, request).await)
}

async fn execute_member(engine: &Engine, member_id: Ulid, request: Request) -> Result<Value, EngineError> {
    match request {
        Request::BookClass {
            occurrence_id,
            category,
            notes,
        } => to_value(
            engine
                .book_class(BookClass {
                    member_id,
                    occurrence_id,
                    category,
                    notes,
                })
                .await?,
        ),
        Request::CancelClassReservation {
            reservation_id,
            reason,
        } => to_value(
            engine
                .cancel_class_reservation(member_id, reservation_id, reason)
                .await?,
        ),
        Request::BookTrainerAppointment {
            trainer_id,
            date,
            start,
            end,
            category,
            location,
            focus,
        } => to_value(
            engine
                .book_trainer_appointment(BookAppointment {
                    member_id,
                    trainer_id,
                    date,
                    start,
                    end,
                    category,
                    location,
                    focus,
                })
                .await?,
        ),
        Request::CancelTrainerAppointment {
            appointment_id,
            reason,
        } => to_value(
            engine
                .cancel_trainer_appointment(member_id, appointment_id, reason)
                .await?,
        ),
        Request::MyReservations => to_value(engine.member_reservations(member_id).await?),
        Request::Occurrence { id } => to_value(engine.occurrence(id).await?),
        Request::UpcomingOccurrences { from, to } => {
            to_value(engine.upcoming_occurrences(from, to).await?)
        }
        Request::Waitlist { occurrence_id } => {
            // Other members' reservation details stay private; expose positions only.
            let queue = engine.waitlist(occurrence_id).await?;
            let position = queue.iter().position(|r| r.member_id == member_id).map(|p| p + 1);
            to_value(json!({ "length": queue.len(), "position": position }))
        }
        Request::Reservation { id } => {
            let reservation = engine.reservation(id).await?;
            if reservation.member_id != member_id {
                return Err(EngineError::NotFound(id));
            }
            to_value(reservation)
        }
        Request::Appointment { id } => {
            let appointment = engine.appointment(id).await?;
            if appointment.member_id != member_id {
                return Err(EngineError::NotFound(id));
            }
            to_value(appointment)
        }
        Request::Trainer { id } => to_value(engine.trainer(id).await?),
        Request::TrainerSlots { trainer_id } => to_value(engine.trainer_slots(trainer_id).await?),
        other => Err(EngineError::InvalidInput(format!(
            "operation not available: {other:?}"
        ))),
    }
}

async fn execute_admin(engine: &Engine, request: Request) -> Result<Value, EngineError> {
    match request {
        Request::ScheduleOccurrence(req) => to_value(engine.schedule_occurrence(req).await?),
        Request::CancelOccurrence {
            occurrence_id,
            reason,
        } => to_value(engine.cancel_occurrence(occurrence_id, reason).await?),
        Request::CompleteOccurrence { occurrence_id } => {
            engine.complete_occurrence(occurrence_id).await?;
            to_value(engine.occurrence(occurrence_id).await?)
        }
        Request::RegisterTrainer(req) => to_value(engine.register_trainer(req).await?),
        Request::UpdateTrainer { trainer_id, update } => {
            to_value(engine.update_trainer(trainer_id, update).await?)
        }
        Request::OpenTrainerSlot {
            trainer_id,
            date,
            start,
            end,
        } => to_value(engine.open_trainer_slot(trainer_id, date, start, end).await?),
        Request::PendingRefunds => to_value(engine.pending_refunds().await),
        Request::RetryPendingRefunds => {
            let issued = engine.retry_pending_refunds().await;
            to_value(json!({ "issued": issued }))
        }
        other => Err(EngineError::InvalidInput(format!(
            "operation not available: {other:?}"
        ))),
    }
}

/// Next pushed notification, or never if the connection has not subscribed.
async fn next_notification(
    rx: &mut Option<broadcast::Receiver<Notification>>,
) -> Option<Notification> {
    let Some(receiver) = rx.as_mut() else {
        return std::future::pending().await;
    };
    loop {
        match receiver.recv().await {
            Ok(n) => return Some(n),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "subscriber lagged; notifications dropped");
            }
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}

fn codec_err(e: LinesCodecError) -> io::Error {
    match e {
        LinesCodecError::Io(e) => e,
        other => io::Error::new(io::ErrorKind::InvalidData, other),
    }
}

/// Serve one client until it disconnects.
pub async fn process_connection(socket: TcpStream, ctx: Arc<ServerContext>) -> io::Result<()> {
    let mut framed = Framed::new(socket, LinesCodec::new_with_max_length(MAX_REQUEST_BYTES));
    let mut subscription: Option<broadcast::Receiver<Notification>> = None;
    let mut subscribed_member: Option<Ulid> = None;

    let result = loop {
        tokio::select! {
            line = framed.next() => {
                let line = match line {
                    None => break Ok(()),
                    Some(Ok(line)) => line,
                    Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                        let err = EngineError::InvalidInput(format!("request longer than {MAX_REQUEST_BYTES} bytes"));
                        framed.send(Reply::err(&err).to_line()).await.map_err(codec_err)?;
                        break Ok(());
                    }
                    Some(Err(e)) => break Err(codec_err(e)),
                };
                if line.trim().is_empty() {
                    continue;
                }
                let handled = handle_line(&ctx, &line).await;
                if let Some(rx) = handled.subscribe {
                    if let Reply::Ok { result, .. } = &handled.reply {
                        subscribed_member = result
                            .get("member_id")
                            .and_then(|v| serde_json::from_value(v.clone()).ok());
                    }
                    subscription = Some(rx);
                }
                if let Err(e) = framed.send(handled.reply.to_line()).await {
                    break Err(codec_err(e));
                }
            }
            Some(notification) = next_notification(&mut subscription) => {
                let push = Reply::Push { notification };
                if let Err(e) = framed.send(push.to_line()).await {
                    break Err(codec_err(e));
                }
            }
        }
    };

    drop(subscription);
    if let (Some(hub), Some(member)) = (&ctx.hub, subscribed_member) {
        hub.prune(&member);
    }
    result
}

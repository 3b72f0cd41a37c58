use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{stream, StreamExt};
use thiserror::Error;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, warn};

use crate::arrivals::{Arrival, ArrivalService};

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("failed to encode push payload: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("socket send failed: {0}")]
    Send(#[from] axum::Error),
}

/// Per-session state for the push loop: the latest monitored id set and the
/// deadline for the next spontaneous push.
struct Session {
    stop_ids: Vec<u32>,
    next_push: Instant,
    interval: Duration,
}

impl Session {
    fn new(interval: Duration, now: Instant) -> Self {
        Session {
            stop_ids: Vec::new(),
            next_push: now + interval,
            interval,
        }
    }

    /// Replace the monitored set from an inbound message. The caller pushes
    /// immediately afterwards; an unreadable message leaves the set alone.
    fn replace_ids(&mut self, text: &str) -> Result<(), serde_json::Error> {
        self.stop_ids = parse_stop_ids(text)?;
        Ok(())
    }

    /// Ids to fetch on a spontaneous tick. Nothing is pushed before the
    /// first id set arrives.
    fn tick_ids(&self) -> Option<&[u32]> {
        if self.stop_ids.is_empty() {
            None
        } else {
            Some(&self.stop_ids)
        }
    }

    /// Restart the interval from `now`, superseding any pending wait.
    fn arm_timer(&mut self, now: Instant) {
        self.next_push = now + self.interval;
    }
}

/// One live push session. The peer sends a JSON array of stop ids; each new
/// set triggers an immediate fetch-and-push and resets the interval timer,
/// and a spontaneous push fires every `interval` otherwise. Any push failure
/// ends the session; the socket is dropped on every exit path.
pub async fn run(
    mut socket: WebSocket,
    arrivals: Arc<ArrivalService>,
    interval: Duration,
    max_concurrent: usize,
) {
    let mut session = Session::new(interval, Instant::now());

    loop {
        tokio::select! {
            inbound = socket.recv() => match inbound {
                Some(Ok(Message::Text(text))) => match session.replace_ids(&text) {
                    Ok(()) => {
                        if let Err(err) =
                            push_cycle(&mut socket, &arrivals, &session.stop_ids, max_concurrent)
                                .await
                        {
                            warn!("live channel push failed: {err}");
                            return;
                        }
                        session.arm_timer(Instant::now());
                    }
                    Err(err) => debug!("ignoring unreadable stop id message: {err}"),
                },
                Some(Ok(Message::Close(_))) | None => return,
                // pings are answered by axum itself; anything else is noise
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    debug!("live channel receive error: {err}");
                    return;
                }
            },
            _ = sleep_until(session.next_push) => {
                if let Some(ids) = session.tick_ids() {
                    if let Err(err) =
                        push_cycle(&mut socket, &arrivals, ids, max_concurrent).await
                    {
                        warn!("live channel push failed: {err}");
                        return;
                    }
                }
                session.arm_timer(Instant::now());
            }
        }
    }
}

fn parse_stop_ids(text: &str) -> Result<Vec<u32>, serde_json::Error> {
    serde_json::from_str(text)
}

/// Fetch arrivals for every monitored stop with bounded parallelism and push
/// one object keyed by stop id. Ids over this channel carry no related-stop
/// pairing, so each is queried on its own.
async fn push_cycle(
    socket: &mut WebSocket,
    arrivals: &ArrivalService,
    stop_ids: &[u32],
    max_concurrent: usize,
) -> Result<(), ChannelError> {
    let fetched: Vec<(u32, Vec<Arrival>)> = stream::iter(stop_ids.iter().copied())
        .map(|stop_id| async move { (stop_id, arrivals.arrivals_for(stop_id, &[]).await) })
        .buffer_unordered(max_concurrent.max(1))
        .collect()
        .await;
    let body = encode_push(fetched)?;
    socket.send(Message::Text(body.into())).await?;
    Ok(())
}

/// Key the payload by stop id; the BTreeMap keeps the object ordered by id
/// regardless of fetch completion order.
fn encode_push(fetched: Vec<(u32, Vec<Arrival>)>) -> Result<String, serde_json::Error> {
    let payload: BTreeMap<u32, Vec<Arrival>> = fetched.into_iter().collect();
    serde_json::to_string(&payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_id_messages_parse() {
        assert_eq!(parse_stop_ids("[40380, 1001]").unwrap(), vec![40_380, 1001]);
        assert_eq!(parse_stop_ids("[]").unwrap(), Vec::<u32>::new());
        assert!(parse_stop_ids("{\"stop\": 1}").is_err());
        assert!(parse_stop_ids("not json").is_err());
    }

    #[test]
    fn new_id_set_supersedes_pending_wait() {
        let interval = Duration::from_secs(30);
        let start = Instant::now();
        let mut session = Session::new(interval, start);
        let original_deadline = session.next_push;

        // a message lands 12s into the wait; the caller pushes immediately
        // and the timer restarts from that moment
        let at_receipt = start + Duration::from_secs(12);
        session.replace_ids("[40123, 1001]").unwrap();
        session.arm_timer(at_receipt);

        assert_eq!(session.stop_ids, vec![40_123, 1001]);
        assert_eq!(session.next_push, at_receipt + interval);
        assert!(session.next_push > original_deadline);
    }

    #[test]
    fn spontaneous_tick_uses_latest_set() {
        let mut session = Session::new(Duration::from_secs(30), Instant::now());
        session.replace_ids("[1001]").unwrap();
        session.replace_ids("[40123, 40124]").unwrap();
        assert_eq!(session.tick_ids(), Some(&[40_123, 40_124][..]));
    }

    #[test]
    fn nothing_ticks_before_the_first_id_set() {
        let session = Session::new(Duration::from_secs(30), Instant::now());
        assert_eq!(session.tick_ids(), None);
    }

    #[test]
    fn unreadable_message_keeps_previous_set() {
        let mut session = Session::new(Duration::from_secs(30), Instant::now());
        session.replace_ids("[1001]").unwrap();
        assert!(session.replace_ids("not json").is_err());
        assert_eq!(session.tick_ids(), Some(&[1001][..]));
    }

    #[test]
    fn push_payload_is_keyed_and_ordered_by_stop_id() {
        let fetched = vec![(40_123, Vec::new()), (1001, Vec::new())];
        let body = encode_push(fetched).unwrap();
        assert_eq!(body, r#"{"1001":[],"40123":[]}"#);
    }
}

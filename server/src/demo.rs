//! Counter game used by the `server` binary and the integration tests.
//!
//! Players send `inc`, `dec` or `add` (with an integer payload) and every
//! player of the instance is told the new score after each tick.

use crate::scheduler::{Instance, ServerHandle, TickError};
use serde::{Deserialize, Serialize};
use shared::GenericMessage;

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterState {
    pub score: i64,
}

/// Free-form per-player data; the counter only needs a display name.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct CounterPlayer {
    #[serde(default)]
    pub name: String,
}

pub type CounterInstance = Instance<CounterState, CounterPlayer, GenericMessage>;

pub fn counter_tick(
    instance: CounterInstance,
    server: &mut ServerHandle<GenericMessage>,
) -> Result<CounterState, TickError> {
    let mut state = instance.record.state;
    if instance.events.is_empty() {
        return Ok(state);
    }

    for event in &instance.events {
        match event.kind.as_str() {
            "inc" => state.score += 1,
            "dec" => state.score -= 1,
            "add" => {
                let amount = match &event.message {
                    Some(message) => message.data_as::<i64>()?,
                    None => return Err(format!("event {} has no amount", event.id).into()),
                };
                state.score += amount;
            }
            // Unknown input is ignored rather than failing the whole batch
            _ => {}
        }
    }

    server.send_message_to_all(GenericMessage::new(
        "score",
        serde_json::json!({ "score": state.score }),
    ));
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{Event, InstanceRecord, PlayerData};

    fn event(id: u64, kind: &str, message: Option<GenericMessage>) -> Event<GenericMessage> {
        Event {
            id,
            instance_id: "g1".to_string(),
            player_id: "p1".to_string(),
            kind: kind.to_string(),
            message,
        }
    }

    fn instance(events: Vec<Event<GenericMessage>>) -> CounterInstance {
        let mut record = InstanceRecord::new("g1");
        record.players = vec![PlayerData {
            id: "p1".to_string(),
            data: CounterPlayer::default(),
        }];
        Instance { record, events }
    }

    #[test]
    fn test_counter_applies_events_and_broadcasts() {
        let mut handle = ServerHandle::new("g1", vec!["p1".to_string()]);
        let amount = GenericMessage::new("add", serde_json::json!(5));
        let events = vec![
            event(1, "inc", None),
            event(2, "add", Some(amount)),
            event(3, "dec", None),
            event(4, "dance", None),
        ];

        let state = counter_tick(instance(events), &mut handle).unwrap();
        assert_eq!(state, CounterState { score: 5 });
        assert_eq!(handle.pending_messages(), 1);
    }

    #[test]
    fn test_counter_without_events_is_silent() {
        let mut handle = ServerHandle::new("g1", vec!["p1".to_string()]);
        let state = counter_tick(instance(Vec::new()), &mut handle).unwrap();
        assert_eq!(state.score, 0);
        assert_eq!(handle.pending_messages(), 0);
    }

    #[test]
    fn test_add_without_amount_fails() {
        let mut handle = ServerHandle::new("g1", vec!["p1".to_string()]);
        let result = counter_tick(instance(vec![event(1, "add", None)]), &mut handle);
        assert!(result.is_err());
    }
}

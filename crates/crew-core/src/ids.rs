use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! branded_id {
    ($name:ident, $prefix:expr) => {
        #[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new() -> Self {
                Self(format!("{}_{}", $prefix, Uuid::now_v7()))
            }

            pub fn from_raw(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = std::convert::Infallible;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.to_owned()))
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

branded_id!(SessionId, "sess");
branded_id!(TurnId, "turn");
branded_id!(MessageId, "msg");
branded_id!(ThoughtId, "thought");
branded_id!(ToolCallId, "toolu");
branded_id!(InvocationId, "inv");
branded_id!(QuestionId, "q");
branded_id!(NoteId, "note");
branded_id!(TodoId, "todo");
branded_id!(GroupId, "grp");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_kind_carries_its_prefix() {
        let ids = [
            SessionId::new().to_string(),
            TurnId::new().to_string(),
            MessageId::new().to_string(),
            ThoughtId::new().to_string(),
            InvocationId::new().to_string(),
            QuestionId::new().to_string(),
            NoteId::new().to_string(),
            TodoId::new().to_string(),
            GroupId::new().to_string(),
        ];
        let prefixes = ["sess_", "turn_", "msg_", "thought_", "inv_", "q_", "note_", "todo_", "grp_"];
        for (id, prefix) in ids.iter().zip(prefixes) {
            assert!(id.starts_with(prefix), "{id} lacks {prefix}");
        }
    }

    #[test]
    fn provider_call_ids_are_kept_verbatim() {
        let id = ToolCallId::from_raw("call_abc123");
        assert_eq!(id.as_str(), "call_abc123");
        assert_eq!(serde_json::to_string(&id).unwrap(), r#""call_abc123""#);
    }

    #[test]
    fn parse_and_serde_agree() {
        let id = GroupId::new();
        let parsed: GroupId = id.to_string().parse().unwrap();
        let decoded: GroupId = serde_json::from_str(&serde_json::to_string(&id).unwrap()).unwrap();
        assert_eq!(parsed, id);
        assert_eq!(decoded, id);
    }

    #[test]
    fn new_ids_sort_by_creation() {
        let ids: Vec<TurnId> = (0..100).map(|_| TurnId::new()).collect();
        for w in ids.windows(2) {
            assert!(w[0].as_str() < w[1].as_str(), "not monotonic: {} >= {}", w[0], w[1]);
        }
    }
}

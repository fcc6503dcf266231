// Topic layout shared with the serial bridge: commands go out on
// pump/{id}/command, the bridge publishes confirmed state on
// pump/{id}/status.

use crate::pump::PumpId;

pub const ROOT: &str = "pump";

pub fn command_topic(pump_id: PumpId) -> String {
    format!("{}/{}/command", ROOT, pump_id)
}

pub fn status_topic(pump_id: PumpId) -> String {
    format!("{}/{}/status", ROOT, pump_id)
}

// Wildcards
pub fn status_wildcard_all() -> &'static str {
    "pump/+/status"
}

/// Extract the pump id from a status topic. Anything that is not exactly
/// `pump/{id}/status` yields `None`.
pub fn parse_status_topic(topic: &str) -> Option<PumpId> {
    let mut parts = topic.split('/');
    if parts.next()? != ROOT {
        return None;
    }
    let id: PumpId = parts.next()?.parse().ok()?;
    if parts.next()? != "status" {
        return None;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_round_trip() {
        assert_eq!(command_topic(PumpId(1)), "pump/1/command");
        assert_eq!(status_topic(PumpId(2)), "pump/2/status");
        assert_eq!(parse_status_topic("pump/2/status"), Some(PumpId(2)));
    }

    #[test]
    fn malformed_topics_are_rejected() {
        assert_eq!(parse_status_topic("pump/1/command"), None);
        assert_eq!(parse_status_topic("valve/1/status"), None);
        assert_eq!(parse_status_topic("pump/one/status"), None);
        assert_eq!(parse_status_topic("pump/1/status/extra"), None);
        assert_eq!(parse_status_topic("pump/1"), None);
        assert_eq!(parse_status_topic(""), None);
    }
}

//! The authoritative per-pump status map. Optimistic command echoes merge
//! into it; status messages from the bridge replace entries wholesale.
//! Callers are expected to serialize access (the controller task is the
//! single writer), so this stays a plain struct with no interior locking.

use std::collections::HashMap;

use crate::pump::{PumpCommand, PumpId, PumpStatus};

#[derive(Debug, Clone)]
pub struct StatusBoard {
    statuses: HashMap<PumpId, PumpStatus>,
}

impl StatusBoard {
    /// Seed an entry per configured pump with the startup default.
    pub fn new(pump_ids: &[PumpId]) -> Self {
        Self {
            statuses: pump_ids
                .iter()
                .map(|&id| (id, PumpStatus::default_for(id)))
                .collect(),
        }
    }

    /// Optimistic update: merge the present fields of `command` onto the
    /// stored status. Fails for pump ids outside the configured set.
    pub fn apply_command(&mut self, pump_id: PumpId, command: &PumpCommand) -> Option<PumpStatus> {
        let status = self.statuses.get_mut(&pump_id)?;
        status.apply(command);
        Some(status.clone())
    }

    /// Authoritative update: replace the stored status unconditionally.
    /// Last writer wins on arrival order; no stale-message detection.
    pub fn apply_status(&mut self, status: PumpStatus) -> Option<PumpStatus> {
        let slot = self.statuses.get_mut(&status.pump_id)?;
        *slot = status;
        Some(slot.clone())
    }

    pub fn read(&self, pump_id: PumpId) -> Option<PumpStatus> {
        self.statuses.get(&pump_id).cloned()
    }

    /// All statuses, ordered by pump id for stable API output.
    pub fn all(&self) -> Vec<PumpStatus> {
        let mut all: Vec<PumpStatus> = self.statuses.values().cloned().collect();
        all.sort_by_key(|s| s.pump_id);
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn board() -> StatusBoard {
        StatusBoard::new(&[PumpId(1), PumpId(2)])
    }

    #[test]
    fn seeds_defaults_for_configured_pumps() {
        let board = board();
        let status = board.read(PumpId(1)).unwrap();
        assert!(!status.enable);
        assert_eq!(status.rpm, 0.0);
        assert!(board.read(PumpId(3)).is_none());
        assert_eq!(board.all().len(), 2);
    }

    #[test]
    fn optimistic_merge_keeps_absent_fields() {
        let mut board = board();
        board
            .apply_command(
                PumpId(1),
                &PumpCommand {
                    rpm: Some(100.0),
                    ..Default::default()
                },
            )
            .unwrap();
        let status = board.read(PumpId(1)).unwrap();
        assert_eq!(status.rpm, 100.0);
        assert!(!status.enable);
    }

    #[test]
    fn unknown_pump_is_refused() {
        let mut board = board();
        assert!(board.apply_command(PumpId(9), &PumpCommand::disable()).is_none());
        assert!(board
            .apply_status(PumpStatus {
                pump_id: PumpId(9),
                ..PumpStatus::default_for(PumpId(9))
            })
            .is_none());
    }

    #[test]
    fn authoritative_status_overrides_optimistic_value() {
        let mut board = board();
        board
            .apply_command(
                PumpId(1),
                &PumpCommand {
                    rpm: Some(100.0),
                    ..Default::default()
                },
            )
            .unwrap();

        let mut incoming = PumpStatus::default_for(PumpId(1));
        incoming.enable = true;
        incoming.rpm = 120.0;
        board.apply_status(incoming).unwrap();

        let status = board.read(PumpId(1)).unwrap();
        assert_eq!(status.rpm, 120.0);
        assert!(status.enable);
    }

    #[test]
    fn updates_arrive_in_strict_order() {
        // default -> optimistic -> authoritative -> optimistic again
        let mut board = board();
        assert_eq!(board.read(PumpId(2)).unwrap().rpm, 0.0);

        board
            .apply_command(
                PumpId(2),
                &PumpCommand {
                    rpm: Some(60.0),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(board.read(PumpId(2)).unwrap().rpm, 60.0);

        let mut incoming = PumpStatus::default_for(PumpId(2));
        incoming.rpm = 55.0;
        board.apply_status(incoming).unwrap();
        assert_eq!(board.read(PumpId(2)).unwrap().rpm, 55.0);

        board
            .apply_command(
                PumpId(2),
                &PumpCommand {
                    enable: Some(true),
                    ..Default::default()
                },
            )
            .unwrap();
        let status = board.read(PumpId(2)).unwrap();
        assert!(status.enable);
        assert_eq!(status.rpm, 55.0);
    }
}

// src/controller/master.rs

//! Mastership as decided by the election collaborator.

use std::time::Duration;
use tokio::time::Instant;

/// How a mastership update changed this controller's role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MasterTransition {
    Gained,
    Lost,
    Unchanged,
}

/// Mastership of this controller and its post-election moratorium
#[derive(Debug, Clone)]
pub struct MasterInfo {
    own_index: u16,
    is_master: bool,
    master_index: Option<u16>,
    master_since: Option<Instant>,
    moratorium: Duration,
}

impl MasterInfo {
    pub fn new(own_index: u16, moratorium: Duration) -> Self {
        Self {
            own_index,
            is_master: false,
            master_index: None,
            master_since: None,
            moratorium,
        }
    }

    pub fn update(&mut self, is_master: bool, master_index: Option<u16>, now: Instant) -> MasterTransition {
        self.master_index = if is_master { Some(self.own_index) } else { master_index };
        match (self.is_master, is_master) {
            (false, true) => {
                self.is_master = true;
                self.master_since = Some(now);
                MasterTransition::Gained
            }
            (true, false) => {
                self.is_master = false;
                self.master_since = None;
                MasterTransition::Lost
            }
            _ => MasterTransition::Unchanged,
        }
    }

    pub fn is_master(&self) -> bool {
        self.is_master
    }

    pub fn master_index(&self) -> Option<u16> {
        self.master_index
    }

    /// True while a freshly elected master still distrusts its view of reported states
    pub fn in_moratorium(&self, now: Instant) -> bool {
        match self.master_since {
            Some(since) if self.is_master => now < since + self.moratorium,
            _ => false,
        }
    }

    /// Explanation for callers that reached a controller which is not master
    pub fn not_master_reason(&self) -> String {
        match self.master_index {
            Some(index) if index != self.own_index => format!(
                "Cluster controller {} is not master; controller {} is",
                self.own_index, index
            ),
            _ => format!(
                "Cluster controller {} is not master and no master is currently known",
                self.own_index
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_moratorium_window() {
        let mut master = MasterInfo::new(0, Duration::from_secs(10));
        let start = Instant::now();
        assert!(!master.in_moratorium(start));

        assert_eq!(master.update(true, None, start), MasterTransition::Gained);
        assert!(master.in_moratorium(start + Duration::from_secs(5)));
        assert!(!master.in_moratorium(start + Duration::from_secs(10)));

        assert_eq!(master.update(true, None, start + Duration::from_secs(20)), MasterTransition::Unchanged);
        assert!(!master.in_moratorium(start + Duration::from_secs(20)));
    }

    #[test]
    fn test_losing_mastership() {
        let mut master = MasterInfo::new(1, Duration::ZERO);
        master.update(true, None, Instant::now());
        assert_eq!(master.master_index(), Some(1));

        assert_eq!(master.update(false, Some(2), Instant::now()), MasterTransition::Lost);
        assert!(!master.is_master());
        assert!(master.not_master_reason().contains("controller 2 is"));

        master.update(false, None, Instant::now());
        assert!(master.not_master_reason().contains("no master"));
    }
}

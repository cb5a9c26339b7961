// ETW session naming: `DC_<label>_<pid>`. The trailing pid is load-bearing,
// orphan cleanup parses it to decide whether the owner is still alive.
use crate::error::EtwError;
use crate::{log_info, log_warn};

pub const SESSION_PREFIX: &str = "DC_";
pub const PRESENTMON_LABEL: &str = "PresentMon";

pub fn session_name(label: &str, pid: u32) -> String {
    format!("{}{}_{}", SESSION_PREFIX, label, pid)
}

pub fn parse_session_pid(name: &str) -> Option<u32> {
    let rest = name.strip_prefix(SESSION_PREFIX)?;
    let (label, pid) = rest.rsplit_once('_')?;
    if label.is_empty() || pid.is_empty() || !pid.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    pid.parse().ok()
}

pub trait SessionControl: Send + Sync {
    fn list_sessions(&self) -> Result<Vec<String>, EtwError>;
    fn stop_session(&self, name: &str) -> Result<(), EtwError>;
}

/// Stops `DC_*` sessions whose owning process is gone. Returns the names
/// that were stopped.
pub fn close_orphaned_sessions<C: SessionControl + ?Sized>(
    control: &C,
    is_alive: impl Fn(u32) -> bool,
) -> Vec<String> {
    let sessions = match control.list_sessions() {
        Ok(sessions) => sessions,
        Err(e) => {
            log_warn!("Could not enumerate ETW sessions: {}", e);
            return Vec::new();
        }
    };

    let mut stopped = Vec::new();
    for name in sessions {
        let Some(pid) = parse_session_pid(&name) else {
            continue;
        };
        if is_alive(pid) {
            continue;
        }
        match control.stop_session(&name) {
            Ok(()) => {
                log_info!("Stopped orphaned ETW session {} (pid {} not running)", name, pid);
                stopped.push(name);
            }
            Err(e) => log_warn!("Failed to stop orphaned ETW session {}: {}", name, e),
        }
    }
    stopped
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct FakeSessions {
        names: Vec<String>,
        stopped: Mutex<Vec<String>>,
    }

    impl SessionControl for FakeSessions {
        fn list_sessions(&self) -> Result<Vec<String>, EtwError> {
            Ok(self.names.clone())
        }

        fn stop_session(&self, name: &str) -> Result<(), EtwError> {
            self.stopped.lock().push(name.to_string());
            Ok(())
        }
    }

    #[test]
    fn names_round_trip_through_parser() {
        assert_eq!(session_name(PRESENTMON_LABEL, 1234), "DC_PresentMon_1234");
        assert_eq!(parse_session_pid("DC_PresentMon_1234"), Some(1234));
        assert_eq!(parse_session_pid("DC_Multi_Part_Label_77"), Some(77));
        assert_eq!(parse_session_pid("DC__5"), None);
        assert_eq!(parse_session_pid("DC_PresentMon_"), None);
        assert_eq!(parse_session_pid("DC_PresentMon_12a"), None);
        assert_eq!(parse_session_pid("NT Kernel Logger"), None);
        assert_eq!(parse_session_pid("XDC_Foo_1"), None);
    }

    #[test]
    fn only_dead_owner_sessions_are_stopped() {
        let live_pid = std::process::id();
        let control = FakeSessions {
            names: vec![
                "DC_Foo_999999".to_string(),
                format!("DC_Foo_{}", live_pid),
                "EventLog-System".to_string(),
            ],
            stopped: Mutex::new(Vec::new()),
        };

        let stopped = close_orphaned_sessions(&control, |pid| pid == live_pid);
        assert_eq!(stopped, vec!["DC_Foo_999999".to_string()]);
        assert_eq!(*control.stopped.lock(), vec!["DC_Foo_999999".to_string()]);
    }
}

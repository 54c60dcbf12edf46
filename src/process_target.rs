//! Component I: resolves the `"<exe_name>:<pid>"` configuration string
//! naming the process to capture. Process enumeration and a selection UI
//! are explicitly out of scope (SPEC_FULL.md §1); this module is the one
//! real, swappable piece of that surface the capture service needs to
//! actually start against a live target.

use anyhow::{anyhow, Context, Result};
use log::{info, warn};
use sysinfo::System;

/// A parsed `"<exe_name>:<pid>"` target selector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetProcess {
    pub exe_name: String,
    pub pid: u32,
}

impl TargetProcess {
    pub fn parse(selector: &str) -> Result<Self> {
        let (exe_name, pid_str) = selector
            .rsplit_once(':')
            .ok_or_else(|| anyhow!("target selector '{selector}' is not in '<exe_name>:<pid>' form"))?;
        let pid: u32 = pid_str
            .parse()
            .with_context(|| format!("invalid pid in target selector '{selector}'"))?;
        if exe_name.is_empty() {
            return Err(anyhow!("target selector '{selector}' has an empty executable name"));
        }
        Ok(Self { exe_name: exe_name.to_string(), pid })
    }

    pub fn to_selector(&self) -> String {
        format!("{}:{}", self.exe_name, self.pid)
    }
}

/// Resolves a [`TargetProcess`] against the live process list, re-finding a
/// stale pid by executable name.
pub trait TargetSelector: Send + Sync {
    fn resolve(&self, target: &TargetProcess) -> Result<TargetProcess>;
}

/// Production implementation backed by `sysinfo`'s process snapshot.
pub struct SysinfoTargetSelector;

impl SysinfoTargetSelector {
    pub fn new() -> Self {
        Self
    }
}

impl Default for SysinfoTargetSelector {
    fn default() -> Self {
        Self::new()
    }
}

impl TargetSelector for SysinfoTargetSelector {
    fn resolve(&self, target: &TargetProcess) -> Result<TargetProcess> {
        let mut system = System::new();
        system.refresh_processes(sysinfo::ProcessesToUpdate::All);

        let pid = sysinfo::Pid::from_u32(target.pid);
        if let Some(process) = system.process(pid) {
            if process_name_matches(process.name(), &target.exe_name) {
                info!("target process {} still running at pid {}", target.exe_name, target.pid);
                return Ok(target.clone());
            }
        }

        let found = system
            .processes()
            .values()
            .find(|p| process_name_matches(p.name(), &target.exe_name));

        match found {
            Some(process) => {
                let new_pid = process.pid().as_u32();
                info!(
                    "target process {} re-resolved from stale pid {} to {}",
                    target.exe_name, target.pid, new_pid
                );
                Ok(TargetProcess { exe_name: target.exe_name.clone(), pid: new_pid })
            }
            None => {
                warn!("target process {} not found in the live process list", target.exe_name);
                Err(anyhow!("target process '{}' is not running", target.exe_name))
            }
        }
    }
}

fn process_name_matches(os_name: &std::ffi::OsStr, exe_name: &str) -> bool {
    os_name.to_string_lossy().eq_ignore_ascii_case(exe_name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_exe_name_and_pid() {
        let target = TargetProcess::parse("game.exe:4242").unwrap();
        assert_eq!(target.exe_name, "game.exe");
        assert_eq!(target.pid, 4242);
    }

    #[test]
    fn rejects_malformed_selector() {
        assert!(TargetProcess::parse("game.exe").is_err());
        assert!(TargetProcess::parse(":4242").is_err());
        assert!(TargetProcess::parse("game.exe:notanumber").is_err());
    }

    #[test]
    fn round_trips_to_selector_string() {
        let target = TargetProcess { exe_name: "game.exe".to_string(), pid: 10 };
        assert_eq!(target.to_selector(), "game.exe:10");
    }
}

use std::{
    process::Command,
    thread::{self, JoinHandle},
};

use buffering_proxy_core::SwitchEvent;
use crossbeam_channel::Receiver;

pub const ACTIVE_BACKEND_ENV: &str = "BUFFERING_PROXY_ACTIVE";

/// Runs `script` through `sh -c` after every completed switch. Ends when the event channel closes.
pub fn spawn_switch_hook(script: String, events: Receiver<SwitchEvent>) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new().name("switch-hook".into()).spawn(move || {
        log::info!("[SwitchHook] running `{script}` on switch completion");
        for event in events.iter() {
            if let SwitchEvent::Completed { active } = event {
                run_script(&script, &active.to_string());
            }
        }
        log::info!("[SwitchHook] event channel closed");
    })
}

fn run_script(script: &str, active: &str) -> bool {
    log::info!("[SwitchHook] executing `{script}` for active backend {active}");
    match Command::new("sh").arg("-c").arg(script).env(ACTIVE_BACKEND_ENV, active).status() {
        Ok(status) if status.success() => true,
        Ok(status) => {
            log::error!("[SwitchHook] `{script}` exited with {status}");
            false
        }
        Err(e) => {
            log::error!("[SwitchHook] failed to run `{script}`: {e}");
            false
        }
    }
}

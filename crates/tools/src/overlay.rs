//! Optional "working" overlay: a status window launched when a tool call
//! runs long. A UI nicety, never a correctness feature: every failure path
//! here is swallowed.

use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::debug;

/// Show the overlay once a call has been running this long.
const SHOW_DELAY: Duration = Duration::from_secs(3);
/// Keep it up this long after a call ends so back-to-back calls don't
/// flicker it.
const GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Default)]
struct OverlayState {
    child: Option<Child>,
    /// Bumped on every arm; lets delayed hide tasks detect staleness.
    generation: u64,
    active_calls: usize,
}

/// Process-launched status window, armed per tool dispatch.
#[derive(Debug)]
pub struct Overlay {
    command: Vec<String>,
    state: Mutex<OverlayState>,
}

impl Overlay {
    /// `None` when no overlay command is configured.
    pub fn new(command: Vec<String>) -> Option<Arc<Self>> {
        if command.is_empty() {
            return None;
        }
        Some(Arc::new(Self {
            command,
            state: Mutex::new(OverlayState::default()),
        }))
    }

    /// Arm the overlay for one tool call. Dropping the guard schedules the
    /// grace-period hide.
    pub fn arm(self: &Arc<Self>) -> OverlayGuard {
        {
            let mut state = self.state.lock().unwrap();
            state.generation += 1;
            state.active_calls += 1;
        }

        let overlay = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(SHOW_DELAY).await;
            let mut state = overlay.state.lock().unwrap();
            // Still in some call and nothing re-armed since? Show.
            if state.active_calls > 0 && state.child.is_none() {
                match Command::new(&overlay.command[0])
                    .args(&overlay.command[1..])
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .spawn()
                {
                    Ok(child) => state.child = Some(child),
                    Err(err) => debug!(%err, "overlay launch failed (ignored)"),
                }
            }
        });

        OverlayGuard {
            overlay: Arc::clone(self),
        }
    }

    fn on_call_end(self: &Arc<Self>) {
        let generation = {
            let mut state = self.state.lock().unwrap();
            state.active_calls = state.active_calls.saturating_sub(1);
            state.generation
        };

        let overlay = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(GRACE).await;
            let mut state = overlay.state.lock().unwrap();
            // A newer call arrived inside the grace window; leave it up.
            if state.generation != generation || state.active_calls > 0 {
                return;
            }
            if let Some(mut child) = state.child.take() {
                let _ = child.kill();
                let _ = child.wait();
            }
        });
    }
}

/// RAII handle for one dispatched call.
pub struct OverlayGuard {
    overlay: Arc<Overlay>,
}

impl Drop for OverlayGuard {
    fn drop(&mut self) {
        self.overlay.on_call_end();
    }
}

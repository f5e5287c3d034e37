//! The timer/event model for compiled programs.
//!
//! Timers are deadline-based and polled at the program's suspension points
//! (`WAIT_MS`, `WAIT_FRAMES`, `INPUT`, loop back-edges): the pump collects
//! the timers that have come due, in registration order, and the caller
//! invokes their handlers serialized on the evaluation thread. A repeating
//! timer that fell behind fires once per missed interval (catch-up), and a
//! handler is never re-entered for the same timer id - a timer whose handler
//! is still running is skipped until it finishes.

use std::time::{Duration, Instant};

#[derive(Debug)]
struct TimerEntry {
    id: u64,
    handler: String,
    every: bool,
    active: bool,
    /// Handler currently executing; suppress re-entry.
    running: bool,
    schedule: Schedule,
}

#[derive(Debug)]
enum Schedule {
    Wall { deadline: Instant, interval: Duration },
    Frames { target: u64, interval: u64 },
}

#[derive(Debug)]
pub struct TimerManager {
    entries: Vec<TimerEntry>,
    next_id: u64,
    frame: u64,
}

impl Default for TimerManager {
    fn default() -> Self {
        TimerManager::new()
    }
}

impl TimerManager {
    pub fn new() -> Self {
        TimerManager {
            entries: Vec::new(),
            next_id: 1,
            frame: 0,
        }
    }

    fn register(&mut self, handler: &str, every: bool, schedule: Schedule) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.push(TimerEntry {
            id,
            handler: handler.to_string(),
            every,
            active: true,
            running: false,
            schedule,
        });
        id
    }

    pub fn after_ms(&mut self, ms: u64, handler: &str) -> u64 {
        let interval = Duration::from_millis(ms.max(1));
        self.register(
            handler,
            false,
            Schedule::Wall {
                deadline: Instant::now() + interval,
                interval,
            },
        )
    }

    pub fn every_ms(&mut self, ms: u64, handler: &str) -> u64 {
        let interval = Duration::from_millis(ms.max(1));
        self.register(
            handler,
            true,
            Schedule::Wall {
                deadline: Instant::now() + interval,
                interval,
            },
        )
    }

    pub fn after_frames(&mut self, frames: u64, handler: &str) -> u64 {
        let target = self.frame + frames.max(1);
        self.register(
            handler,
            false,
            Schedule::Frames {
                target,
                interval: frames.max(1),
            },
        )
    }

    pub fn every_frames(&mut self, frames: u64, handler: &str) -> u64 {
        let target = self.frame + frames.max(1);
        self.register(
            handler,
            true,
            Schedule::Frames {
                target,
                interval: frames.max(1),
            },
        )
    }

    pub fn stop(&mut self, id: u64) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.id == id) {
            entry.active = false;
        }
    }

    pub fn stop_by_handler(&mut self, handler: &str) {
        for entry in self.entries.iter_mut().filter(|e| e.handler == handler) {
            entry.active = false;
        }
    }

    pub fn stop_all(&mut self) {
        for entry in &mut self.entries {
            entry.active = false;
        }
    }

    pub fn is_active(&self, id: u64) -> bool {
        self.entries.iter().any(|e| e.id == id && e.active)
    }

    pub fn active_count(&self) -> usize {
        self.entries.iter().filter(|e| e.active).count()
    }

    /// Advance the frame counter (one `wait_frame`).
    pub fn advance_frame(&mut self) {
        self.frame += 1;
    }

    pub fn frame(&self) -> u64 {
        self.frame
    }

    /// Collect the handlers due at `now`, FIFO in registration order. One
    /// entry per missed interval for repeating timers; one-shots deactivate.
    pub fn collect_due(&mut self, now: Instant) -> Vec<(u64, String)> {
        let frame = self.frame;
        let mut due = Vec::new();
        for entry in &mut self.entries {
            if !entry.active || entry.running {
                continue;
            }
            match &mut entry.schedule {
                Schedule::Wall { deadline, interval } => {
                    while *deadline <= now {
                        due.push((entry.id, entry.handler.clone()));
                        if entry.every {
                            *deadline += *interval;
                        } else {
                            entry.active = false;
                            break;
                        }
                    }
                }
                Schedule::Frames { target, interval } => {
                    while *target <= frame {
                        due.push((entry.id, entry.handler.clone()));
                        if entry.every {
                            *target += *interval;
                        } else {
                            entry.active = false;
                            break;
                        }
                    }
                }
            }
        }
        due
    }

    /// Guard a handler invocation against re-entry.
    pub fn set_running(&mut self, id: u64, running: bool) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.id == id) {
            entry.running = running;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_shot_fires_once() {
        let mut timers = TimerManager::new();
        timers.after_ms(1, "PROC_T");
        std::thread::sleep(Duration::from_millis(5));
        let due = timers.collect_due(Instant::now());
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].1, "PROC_T");
        assert!(timers.collect_due(Instant::now()).is_empty());
    }

    #[test]
    fn repeating_timer_catches_up() {
        let mut timers = TimerManager::new();
        timers.every_ms(10, "PROC_T");
        std::thread::sleep(Duration::from_millis(35));
        let due = timers.collect_due(Instant::now());
        assert!(due.len() >= 3, "expected catch-up fires, got {}", due.len());
    }

    #[test]
    fn frame_timers_follow_the_counter() {
        let mut timers = TimerManager::new();
        timers.every_frames(2, "PROC_F");
        assert!(timers.collect_due(Instant::now()).is_empty());
        timers.advance_frame();
        timers.advance_frame();
        assert_eq!(timers.collect_due(Instant::now()).len(), 1);
    }

    #[test]
    fn stop_by_id_name_and_all() {
        let mut timers = TimerManager::new();
        let a = timers.every_ms(1000, "PROC_A");
        timers.every_ms(1000, "PROC_B");
        timers.stop(a);
        assert!(!timers.is_active(a));
        assert_eq!(timers.active_count(), 1);
        timers.stop_by_handler("PROC_B");
        assert_eq!(timers.active_count(), 0);

        timers.every_ms(1000, "PROC_C");
        timers.stop_all();
        assert_eq!(timers.active_count(), 0);
    }

    #[test]
    fn running_handlers_are_not_reentered() {
        let mut timers = TimerManager::new();
        let id = timers.every_ms(1, "PROC_T");
        std::thread::sleep(Duration::from_millis(3));
        timers.set_running(id, true);
        assert!(timers.collect_due(Instant::now()).is_empty());
        timers.set_running(id, false);
        assert!(!timers.collect_due(Instant::now()).is_empty());
    }
}

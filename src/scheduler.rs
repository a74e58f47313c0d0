use crate::runner::{DelayedTask, TaskRunner};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Drives a tick callback at a cadence on one execution context.
///
/// At most one tick is outstanding: scheduling again or cancelling
/// invalidates whatever was scheduled before, even if its task has already
/// been queued. Methods are meant to be called from the execution context.
pub struct FrameScheduler {
    runner: TaskRunner,
    tick: Arc<dyn Fn() + Send + Sync>,
    interval: Duration,
    /// When the current tick was due. Later ticks are spaced from it.
    due: Option<Instant>,
    generation: Arc<AtomicU64>,
    pending: Option<DelayedTask>,
}

impl FrameScheduler {
    pub fn new<F>(runner: TaskRunner, tick: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self {
            runner,
            tick: Arc::new(tick),
            interval: Duration::ZERO,
            due: None,
            generation: Arc::new(AtomicU64::new(0)),
            pending: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Set the cadence and run the first tick as soon as possible
    pub fn schedule_first(&mut self, interval: Duration) {
        self.interval = interval;
        self.due = Some(Instant::now());
        self.schedule(Duration::ZERO);
    }

    pub fn reschedule_after(&mut self, delay: Duration) {
        self.schedule(delay);
    }

    /// Delay for the next tick so that ticks start one interval apart,
    /// whatever the current tick cost or how late it ran.
    ///
    /// Deadlines advance from the previous one, so timer latency does not
    /// add up. Once a tick overruns its slot the next one is due right away
    /// and the cadence restarts from now, without a burst of catch-up ticks.
    pub fn next_delay(&mut self, tick_started: Instant) -> Duration {
        let now = Instant::now();
        let next = self.due.unwrap_or(tick_started) + self.interval;
        if next <= now {
            self.due = Some(now);
            Duration::ZERO
        } else {
            self.due = Some(next);
            next - now
        }
    }

    /// Schedule the tick following the one that started at `tick_started`
    pub fn reschedule_next(&mut self, tick_started: Instant) {
        let delay = self.next_delay(tick_started);
        self.schedule(delay);
    }

    pub fn cancel_all(&mut self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(pending) = self.pending.take() {
            pending.cancel();
        }
    }

    fn schedule(&mut self, delay: Duration) {
        self.cancel_all();

        let armed = self.generation.load(Ordering::SeqCst);
        let generation = Arc::clone(&self.generation);
        let tick = Arc::clone(&self.tick);

        self.pending = Some(self.runner.post_delayed(
            move || {
                if generation.load(Ordering::SeqCst) == armed {
                    tick();
                }
            },
            delay,
        ));
    }
}

impl Drop for FrameScheduler {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::CaptureThread;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::thread;

    #[test]
    fn test_schedule_first_ticks_immediately() {
        let thread = CaptureThread::spawn("sched-first").unwrap();
        let (tx, rx) = mpsc::channel();
        let mut scheduler = FrameScheduler::new(thread.runner().clone(), move || {
            let _ = tx.send(Instant::now());
        });

        let started = Instant::now();
        scheduler.schedule_first(Duration::from_secs(10));
        let ticked = rx.recv_timeout(Duration::from_secs(1)).unwrap();

        assert!(ticked.duration_since(started) < Duration::from_millis(500));
        assert_eq!(scheduler.interval(), Duration::from_secs(10));
    }

    #[test]
    fn test_cancel_all_stops_pending_tick() {
        let thread = CaptureThread::spawn("sched-cancel").unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let ticks = Arc::clone(&count);
        let mut scheduler = FrameScheduler::new(thread.runner().clone(), move || {
            ticks.fetch_add(1, Ordering::SeqCst);
        });

        scheduler.reschedule_after(Duration::from_millis(30));
        scheduler.cancel_all();
        thread::sleep(Duration::from_millis(120));

        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_cancel_suppresses_already_queued_tick() {
        let thread = CaptureThread::spawn("sched-queued").unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let ticks = Arc::clone(&count);
        let mut scheduler = FrameScheduler::new(thread.runner().clone(), move || {
            ticks.fetch_add(1, Ordering::SeqCst);
        });

        // Block the thread so the immediate tick sits in the queue
        let (release_tx, release_rx) = mpsc::channel::<()>();
        thread.runner().post(move || {
            let _ = release_rx.recv_timeout(Duration::from_secs(1));
        });
        scheduler.schedule_first(Duration::from_millis(10));
        scheduler.cancel_all();
        release_tx.send(()).unwrap();

        thread::sleep(Duration::from_millis(100));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_reschedule_replaces_outstanding_tick() {
        let thread = CaptureThread::spawn("sched-replace").unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let ticks = Arc::clone(&count);
        let mut scheduler = FrameScheduler::new(thread.runner().clone(), move || {
            ticks.fetch_add(1, Ordering::SeqCst);
        });

        for _ in 0..5 {
            scheduler.reschedule_after(Duration::from_millis(20));
        }
        thread::sleep(Duration::from_millis(150));

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_next_delay_never_negative() {
        let thread = CaptureThread::spawn("sched-delay").unwrap();
        let mut scheduler = FrameScheduler::new(thread.runner().clone(), || {});
        scheduler.schedule_first(Duration::from_millis(50));
        scheduler.cancel_all();

        let fresh = scheduler.next_delay(Instant::now());
        assert!(fresh <= Duration::from_millis(50));
        assert!(fresh > Duration::from_millis(30));

        thread::sleep(Duration::from_millis(120));
        assert_eq!(scheduler.next_delay(Instant::now()), Duration::ZERO);
    }

    #[test]
    fn test_deadlines_advance_from_previous_deadline() {
        let thread = CaptureThread::spawn("sched-anchor").unwrap();
        let mut scheduler = FrameScheduler::new(thread.runner().clone(), || {});
        scheduler.schedule_first(Duration::from_millis(40));
        scheduler.cancel_all();

        // Tick ran 15ms late; the next one is still due 40ms after the
        // first deadline, not 40ms after the late start
        thread::sleep(Duration::from_millis(15));
        let late_start = Instant::now();
        let delay = scheduler.next_delay(late_start);
        assert!(delay <= Duration::from_millis(25), "delay {:?}", delay);
        assert!(delay > Duration::from_millis(5), "delay {:?}", delay);

        thread::sleep(delay);
        let delay = scheduler.next_delay(Instant::now());
        assert!(delay <= Duration::from_millis(40), "delay {:?}", delay);
        assert!(delay > Duration::from_millis(25), "delay {:?}", delay);
    }

    #[test]
    fn test_overrun_restarts_cadence_without_burst() {
        let thread = CaptureThread::spawn("sched-overrun").unwrap();
        let mut scheduler = FrameScheduler::new(thread.runner().clone(), || {});
        scheduler.schedule_first(Duration::from_millis(20));
        scheduler.cancel_all();

        thread::sleep(Duration::from_millis(70));
        assert_eq!(scheduler.next_delay(Instant::now()), Duration::ZERO);

        // The missed slots are not replayed
        let delay = scheduler.next_delay(Instant::now());
        assert!(delay > Duration::from_millis(10), "delay {:?}", delay);
    }
}

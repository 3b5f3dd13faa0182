//! CPU-side frame pacing for the simulate/render pipeline.
//!
//! There are no GPU fences anywhere: a pair of counting gates is the entire
//! synchronization mechanism between the submission thread and the queue's
//! completion callbacks. [`FramePacer`] owns the gates and the buffer slot
//! rotation and knows nothing about wgpu, so every ordering property can be
//! tested with plain threads.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use arc_swap::ArcSwapOption;

use crate::gate::Gate;
use crate::particle::{self, Particle, Settings, Viewport};

/// Number of rotating particle buffer slots, and therefore how many ticks of
/// render work may be outstanding at once (triple buffering).
pub const FRAMES_IN_FLIGHT: usize = 3;

/// How many simulation passes may be outstanding at once. Always 1: pass N+1
/// reads the buffer pass N wrote, so simulation cannot be pipelined no matter
/// how many slots exist.
pub const SIM_PASSES_IN_FLIGHT: usize = 1;

/// A fully staged particle population waiting to be installed at the next
/// tick boundary.
pub struct Population {
    pub settings: Settings,
    pub particles: Vec<Particle>,
    pub generation: u64,
}

/// Publishing side of the reconfiguration path. Cloneable and usable from any
/// thread; the orchestrator consumes at most one pending population per tick
/// boundary, always the newest.
#[derive(Clone)]
pub struct PopulationMailbox {
    pending: Arc<ArcSwapOption<Population>>,
    next_generation: Arc<AtomicU64>,
}

impl PopulationMailbox {
    fn new() -> Self {
        Self {
            pending: Arc::new(ArcSwapOption::empty()),
            next_generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Sample a complete population for `settings` and publish it. Staging
    /// happens entirely before the swap, so a consumer can never observe a
    /// half-built population. Returns the generation tag of the publish.
    pub fn publish(&self, settings: Settings, viewport: Viewport) -> u64 {
        let particles = particle::spawn(&settings, viewport);
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed) + 1;
        self.pending.store(Some(Arc::new(Population {
            settings,
            particles,
            generation,
        })));
        generation
    }

    pub fn has_pending(&self) -> bool {
        self.pending.load().is_some()
    }
}

/// Completion token for one unit of submitted work. Consuming it (or dropping
/// it, for a tick abandoned after a submission failure) releases the gate it
/// was acquired from, exactly once, from whichever thread holds it.
pub struct GateToken {
    gate: Option<Arc<Gate>>,
}

impl GateToken {
    fn new(gate: Arc<Gate>) -> Self {
        Self { gate: Some(gate) }
    }

    pub fn complete(mut self) {
        if let Some(gate) = self.gate.take() {
            gate.release();
        }
    }
}

impl Drop for GateToken {
    fn drop(&mut self) {
        if let Some(gate) = self.gate.take() {
            gate.release();
        }
    }
}

/// One tick's worth of slot indices and completion tokens.
///
/// The simulation pass reads `read_slot` and writes `write_slot`; the render
/// pass reads `write_slot`. The two completions are observed independently
/// and may arrive in either order.
pub struct Tick {
    pub read_slot: usize,
    pub write_slot: usize,
    pub sim_done: GateToken,
    pub frame_done: GateToken,
}

/// Owner of the gate pair and the buffer slot rotation.
pub struct FramePacer {
    frame_gate: Arc<Gate>,
    sim_gate: Arc<Gate>,
    current_slot: usize,
    generation: u64,
    mailbox: PopulationMailbox,
}

impl FramePacer {
    pub fn new() -> Self {
        Self {
            frame_gate: Arc::new(Gate::new(FRAMES_IN_FLIGHT)),
            sim_gate: Arc::new(Gate::new(SIM_PASSES_IN_FLIGHT)),
            current_slot: 0,
            generation: 0,
            mailbox: PopulationMailbox::new(),
        }
    }

    pub fn mailbox(&self) -> PopulationMailbox {
        self.mailbox.clone()
    }

    /// Slot the next tick's simulation pass will read.
    pub fn current_slot(&self) -> usize {
        self.current_slot
    }

    /// Generation of the population visible to the pipeline.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Install a pending population, if one has been published.
    ///
    /// Blocks until every in-flight tick has retired (all frame permits plus
    /// the simulation permit), hands the incoming read slot and the staged
    /// particles to `install`, then reopens the gates. This is the only point
    /// where a reconfiguration becomes visible, so no GPU pass can ever read
    /// a slot while it is being rewritten.
    pub fn apply_pending(
        &mut self,
        install: impl FnOnce(usize, &Population),
    ) -> Option<Arc<Population>> {
        if !self.mailbox.has_pending() {
            return None;
        }
        for _ in 0..self.frame_gate.capacity() {
            self.frame_gate.acquire();
        }
        self.sim_gate.acquire();

        // Swap after draining so the newest publish wins.
        let population = self.mailbox.pending.swap(None);
        if let Some(ref population) = population {
            install(self.current_slot, population.as_ref());
            self.generation = population.generation;
        }

        self.sim_gate.release();
        for _ in 0..self.frame_gate.capacity() {
            self.frame_gate.release();
        }
        population
    }

    /// Start one tick: acquire the frame gate (backpressure against the
    /// queue) and then the simulation gate (the sequential dependency between
    /// consecutive simulation passes). Blocks until both are available.
    pub fn begin_tick(&mut self) -> Tick {
        self.frame_gate.acquire();
        self.sim_gate.acquire();
        Tick {
            read_slot: self.current_slot,
            write_slot: (self.current_slot + 1) % FRAMES_IN_FLIGHT,
            sim_done: GateToken::new(Arc::clone(&self.sim_gate)),
            frame_done: GateToken::new(Arc::clone(&self.frame_gate)),
        }
    }

    /// Retire the current tick: the slot just written becomes the next read
    /// slot. Rotation is periodic with period [`FRAMES_IN_FLIGHT`].
    pub fn advance(&mut self) {
        self.current_slot = (self.current_slot + 1) % FRAMES_IN_FLIGHT;
    }

    /// Take every permit and keep them. Used at shutdown so no completion
    /// callback can race buffer teardown; blocks until all outstanding work
    /// has signalled its token.
    pub fn drain(&mut self) {
        for _ in 0..self.frame_gate.capacity() {
            self.frame_gate.acquire();
        }
        self.sim_gate.acquire();
    }
}

impl Default for FramePacer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::particle::Coloring;
    use std::sync::atomic::AtomicBool;
    use std::sync::mpsc::channel;
    use std::thread;
    use std::time::Duration;

    fn finish(tick: Tick) {
        tick.sim_done.complete();
        tick.frame_done.complete();
    }

    #[test]
    fn rotation_is_periodic_with_period_three() {
        let mut pacer = FramePacer::new();
        assert_eq!(pacer.current_slot(), 0);
        let mut seen = Vec::new();
        for _ in 0..FRAMES_IN_FLIGHT {
            let tick = pacer.begin_tick();
            assert_eq!(tick.write_slot, (tick.read_slot + 1) % FRAMES_IN_FLIGHT);
            seen.push(tick.read_slot);
            finish(tick);
            pacer.advance();
        }
        assert_eq!(seen, vec![0, 1, 2]);
        assert_eq!(pacer.current_slot(), 0);
    }

    #[test]
    fn completed_ticks_return_all_permits() {
        let mut pacer = FramePacer::new();
        for _ in 0..10 {
            let tick = pacer.begin_tick();
            finish(tick);
            pacer.advance();
        }
        pacer.drain(); // would deadlock if any permit leaked
    }

    #[test]
    fn abandoned_tick_releases_via_token_drop() {
        let mut pacer = FramePacer::new();
        let tick = pacer.begin_tick();
        // Simulates a transient submission failure: the tick is dropped
        // without completing, and the next tick must not be blocked.
        drop(tick);
        let tick = pacer.begin_tick();
        finish(tick);
        pacer.advance();
        pacer.drain();
    }

    #[test]
    fn fourth_tick_blocks_until_a_frame_completes() {
        let mut pacer = FramePacer::new();
        let mut pending_frames = Vec::new();
        for _ in 0..FRAMES_IN_FLIGHT {
            let tick = pacer.begin_tick();
            tick.sim_done.complete();
            pending_frames.push(tick.frame_done);
            pacer.advance();
        }

        let (tx, rx) = channel();
        let handle = thread::spawn(move || {
            let tick = pacer.begin_tick();
            tx.send(()).unwrap();
            finish(tick);
            pacer
        });

        assert!(
            rx.recv_timeout(Duration::from_millis(50)).is_err(),
            "tick 4 started with 3 frames still in flight"
        );

        pending_frames.pop().unwrap().complete();
        rx.recv_timeout(Duration::from_secs(5))
            .expect("tick 4 did not start after a frame completed");
        let mut pacer = handle.join().unwrap();
        drop(pending_frames);
        pacer.advance();
        pacer.drain();
    }

    #[test]
    fn second_simulation_waits_for_the_first() {
        let mut pacer = FramePacer::new();
        let tick = pacer.begin_tick();
        let held_sim = tick.sim_done;
        tick.frame_done.complete();
        pacer.advance();

        let (tx, rx) = channel();
        let handle = thread::spawn(move || {
            let tick = pacer.begin_tick();
            tx.send(()).unwrap();
            finish(tick);
            pacer
        });

        // Frame permits are free, but the simulation permit is still held.
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());

        held_sim.complete();
        rx.recv_timeout(Duration::from_secs(5))
            .expect("simulation gate did not open after completion");
        let mut pacer = handle.join().unwrap();
        pacer.advance();
        pacer.drain();
    }

    #[test]
    fn frame_completions_may_arrive_out_of_submission_order() {
        let mut pacer = FramePacer::new();
        let mut pending = Vec::new();
        for _ in 0..FRAMES_IN_FLIGHT {
            let tick = pacer.begin_tick();
            tick.sim_done.complete();
            pending.push(tick.frame_done);
            pacer.advance();
        }
        // Gate release is count-based, not identity-based: retiring frames in
        // reverse submission order must behave identically.
        while let Some(token) = pending.pop() {
            token.complete();
        }
        for _ in 0..FRAMES_IN_FLIGHT {
            let tick = pacer.begin_tick();
            finish(tick);
            pacer.advance();
        }
        pacer.drain();
    }

    #[test]
    fn apply_pending_installs_into_the_next_read_slot() {
        let mut pacer = FramePacer::new();
        let mailbox = pacer.mailbox();
        assert!(pacer.apply_pending(|_, _| panic!("nothing published")).is_none());

        let settings = Settings {
            coloring: Coloring::Monochrome,
            particle_count: 64,
        };
        let generation = mailbox.publish(settings, Viewport::new(200, 100));
        assert_eq!(generation, 1);

        let mut installed_slot = None;
        let population = pacer
            .apply_pending(|slot, population| {
                installed_slot = Some(slot);
                assert_eq!(population.particles.len(), 64);
            })
            .expect("published population was not applied");
        assert_eq!(installed_slot, Some(pacer.current_slot()));
        assert_eq!(population.settings, settings);
        assert_eq!(pacer.generation(), 1);
        assert!(!mailbox.has_pending());
        pacer.drain(); // all permits must have been returned
    }

    #[test]
    fn zero_count_population_still_paces_a_full_tick() {
        let mut pacer = FramePacer::new();
        let mailbox = pacer.mailbox();
        mailbox.publish(
            Settings {
                coloring: Coloring::Colorful,
                particle_count: 0,
            },
            Viewport::new(800, 600),
        );

        let mut installed = None;
        let population = pacer
            .apply_pending(|slot, population| {
                // Nothing to upload for an empty population; the slot still
                // has to be handed over so the rotation stays intact.
                assert!(population.particles.is_empty());
                installed = Some(slot);
            })
            .expect("zero-count publish was not applied");
        assert_eq!(population.particles.len(), 0);
        assert_eq!(installed, Some(pacer.current_slot()));
        assert_eq!(pacer.generation(), 1);

        // The gates pace identically with nothing alive to draw.
        for _ in 0..FRAMES_IN_FLIGHT {
            let tick = pacer.begin_tick();
            finish(tick);
            pacer.advance();
        }
        pacer.drain();
    }

    #[test]
    fn newest_publish_wins_at_the_boundary() {
        let mut pacer = FramePacer::new();
        let mailbox = pacer.mailbox();
        mailbox.publish(
            Settings {
                coloring: Coloring::Colorful,
                particle_count: 10,
            },
            Viewport::new(100, 100),
        );
        mailbox.publish(
            Settings {
                coloring: Coloring::Monochrome,
                particle_count: 20,
            },
            Viewport::new(100, 100),
        );
        let population = pacer.apply_pending(|_, _| {}).unwrap();
        assert_eq!(population.generation, 2);
        assert_eq!(population.particles.len(), 20);
        // The older publish is gone, not queued.
        assert!(pacer.apply_pending(|_, _| {}).is_none());
    }

    #[test]
    fn apply_pending_waits_for_in_flight_work() {
        let mut pacer = FramePacer::new();
        let mailbox = pacer.mailbox();
        let tick = pacer.begin_tick();
        pacer.advance();

        let retired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&retired);
        let completer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            flag.store(true, Ordering::SeqCst);
            finish(tick);
        });

        mailbox.publish(Settings::default(), Viewport::new(800, 600));
        let applied = pacer.apply_pending(|_, _| {
            assert!(
                retired.load(Ordering::SeqCst),
                "population installed while a tick was still in flight"
            );
        });
        assert!(applied.is_some());
        completer.join().unwrap();
        pacer.drain();
    }
}

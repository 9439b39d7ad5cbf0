//! The engine's single listener (§4.9): the reference point every
//! [`crate::engine::sound::Sound`]'s spatializer measures distance and
//! azimuth against. One listener per `Engine`, updated from a control
//! thread and read every tick by whichever sounds have `is_spatial` set.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::dsp::spatializer::Position;

/// Atomic, control-thread-writable listener position. Plain `AtomicU32`
/// bit-patterns rather than a `Mutex<Position>`, matching the volume/pan
/// atomics used throughout `engine_node` — reads happen on the render
/// thread once per tick per spatial sound and must never block.
pub struct Listener {
    x: AtomicU32,
    y: AtomicU32,
    z: AtomicU32,
}

impl Listener {
    pub fn new() -> Self {
        Self {
            x: AtomicU32::new(0.0f32.to_bits()),
            y: AtomicU32::new(0.0f32.to_bits()),
            z: AtomicU32::new(0.0f32.to_bits()),
        }
    }

    pub fn set_position(&self, x: f32, y: f32, z: f32) {
        self.x.store(x.to_bits(), Ordering::Relaxed);
        self.y.store(y.to_bits(), Ordering::Relaxed);
        self.z.store(z.to_bits(), Ordering::Relaxed);
    }

    pub fn position(&self) -> Position {
        Position {
            x: f32::from_bits(self.x.load(Ordering::Relaxed)),
            y: f32::from_bits(self.y.load(Ordering::Relaxed)),
            z: f32::from_bits(self.z.load(Ordering::Relaxed)),
        }
    }
}

impl Default for Listener {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_origin() {
        let listener = Listener::new();
        assert_eq!(listener.position(), Position::default());
    }

    #[test]
    fn set_position_is_observed_on_next_read() {
        let listener = Listener::new();
        listener.set_position(1.0, 2.0, 3.0);
        let p = listener.position();
        assert_eq!(p, Position { x: 1.0, y: 2.0, z: 3.0 });
    }
}

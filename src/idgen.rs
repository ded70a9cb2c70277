use rand::{thread_rng, Rng};

use super::ID;

/// Largest id usable on the wire.  WAMP ids live in `[1, 2^53)` so that they
/// survive languages which keep integers in IEEE doubles.
pub const MAX_ID: ID = 1u64.rotate_left(53);

/// Picks a fresh random id in `[1, 2^53)`.
///
/// Used for ids with realm-wide scope: session ids, registration and
/// subscription ids.
pub fn random_id() -> ID {
    let mut rng = thread_rng();
    rng.gen_range(1..MAX_ID)
}

/// Generator for ids with session scope.
///
/// Request ids are sequential per originating session.  On reaching the top
/// of the id space the generator re-seeds back to 1; a collision with a
/// request that is still pending after 2^53 intervening requests is not a
/// case worth defending against.
pub struct SessionScopeIdGenerator {
    next: ID,
}

impl SessionScopeIdGenerator {
    pub fn new() -> SessionScopeIdGenerator {
        SessionScopeIdGenerator { next: 1 }
    }

    pub fn next_id(&mut self) -> ID {
        if self.next >= MAX_ID {
            self.next = 1;
        }
        let id = self.next;
        self.next += 1;
        id
    }
}

impl Default for SessionScopeIdGenerator {
    fn default() -> SessionScopeIdGenerator {
        SessionScopeIdGenerator::new()
    }
}

#[cfg(test)]
mod test {
    use super::{random_id, SessionScopeIdGenerator, MAX_ID};

    #[test]
    fn sequential_ids() {
        let mut idgen = SessionScopeIdGenerator::new();
        assert_eq!(idgen.next_id(), 1);
        assert_eq!(idgen.next_id(), 2);
        assert_eq!(idgen.next_id(), 3);
    }

    #[test]
    fn wraps_at_top_of_id_space() {
        let mut idgen = SessionScopeIdGenerator { next: MAX_ID - 1 };
        assert_eq!(idgen.next_id(), MAX_ID - 1);
        assert_eq!(idgen.next_id(), 1);
    }

    #[test]
    fn random_ids_in_range() {
        for _ in 0..1000 {
            let id = random_id();
            assert!(id >= 1 && id < MAX_ID);
        }
    }
}

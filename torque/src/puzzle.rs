use crate::connection::Nonce;
use crate::support::constants::{
    INITIAL_PUZZLE_DIFFICULTY, MAX_PUZZLE_DIFFICULTY, PUZZLE_REFRESH_TIME,
};
use hashbrown::HashSet;
use quark::crypto;
use quark::time;

/// Milliseconds spent computing a puzzle solution per call to `solve_puzzle`, so the
/// cooperative tick loop stays responsive.
pub const MAX_SOLUTION_COMPUTE_FRAGMENT: u64 = 30;
/// Attempts spent per call before the time budget is even consulted.
pub const SOLUTION_FRAGMENT_ITERATIONS: u32 = 50_000;

/// Reasons a submitted puzzle solution is refused.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SolutionError {
    InvalidSolution,
    InvalidServerNonce,
    InvalidClientNonce,
    InvalidPuzzleDifficulty,
}

/// Client nonces that have already redeemed a solution against one server nonce.
/// Two of these exist, for the current and the previous server nonce; entries age
/// out with their nonce.
struct NonceTable {
    entries: HashSet<[u8; Nonce::SIZE]>,
}

impl NonceTable {
    fn new() -> NonceTable {
        NonceTable {
            entries: HashSet::new(),
        }
    }

    fn reset(&mut self) {
        self.entries.clear();
    }

    /// Adds the nonce if absent; returns false when it was already present.
    fn check_add(&mut self, nonce: &Nonce) -> bool {
        self.entries.insert(nonce.0)
    }
}

/// Issues, validates and solves client puzzles: a pre-image problem over
/// (solution, client identity, client nonce, server nonce) whose difficulty the
/// server can raise to throttle connection floods without holding per-client state.
pub struct ClientPuzzleManager {
    current_difficulty: u32,
    last_update_time: u64,
    current_nonce: Nonce,
    last_nonce: Nonce,
    current_table: NonceTable,
    last_table: NonceTable,
}

impl ClientPuzzleManager {
    pub fn new() -> ClientPuzzleManager {
        ClientPuzzleManager {
            current_difficulty: INITIAL_PUZZLE_DIFFICULTY,
            last_update_time: 0,
            current_nonce: Nonce::random(),
            last_nonce: Nonce::random(),
            current_table: NonceTable::new(),
            last_table: NonceTable::new(),
        }
    }

    #[inline]
    pub fn current_nonce(&self) -> Nonce {
        self.current_nonce
    }

    #[inline]
    pub fn current_difficulty(&self) -> u32 {
        self.current_difficulty
    }

    /// Rotates the server nonce when the refresh interval elapses. Solutions against
    /// the previous nonce stay valid until the next rotation.
    pub fn tick(&mut self, now: u64) {
        if now.saturating_sub(self.last_update_time) > PUZZLE_REFRESH_TIME {
            self.last_update_time = now;
            self.last_nonce = self.current_nonce;
            std::mem::swap(&mut self.current_table, &mut self.last_table);
            self.current_table.reset();
            self.current_nonce = Nonce::random();
        }
    }

    fn check_one_solution(
        solution: u32,
        client_nonce: &Nonce,
        server_nonce: &Nonce,
        puzzle_difficulty: u32,
        client_identity: u32,
    ) -> bool {
        if puzzle_difficulty == 0 {
            return true;
        }
        let mut buffer = [0u8; 8];
        buffer[..4].copy_from_slice(&solution.to_be_bytes());
        buffer[4..].copy_from_slice(&client_identity.to_be_bytes());

        let hash = crypto::Sha256::new()
            .update(&buffer)
            .update(&client_nonce.0)
            .update(&server_nonce.0)
            .finish();

        let mut difficulty = puzzle_difficulty;
        let mut index = 0;
        while difficulty > 8 {
            if hash[index] != 0 {
                return false;
            }
            index += 1;
            difficulty -= 8;
        }
        let mask = 0xFFu8 << (8 - difficulty);
        mask & hash[index] == 0
    }

    /// Validates a submitted solution against the current or previous server nonce,
    /// accepting each (client nonce, server nonce) pair at most once.
    pub fn check_solution(
        &mut self,
        solution: u32,
        client_nonce: &Nonce,
        server_nonce: &Nonce,
        puzzle_difficulty: u32,
        client_identity: u32,
    ) -> Result<(), SolutionError> {
        if puzzle_difficulty != self.current_difficulty
            || puzzle_difficulty > MAX_PUZZLE_DIFFICULTY
        {
            return Err(SolutionError::InvalidPuzzleDifficulty);
        }
        let table = if *server_nonce == self.current_nonce {
            &mut self.current_table
        } else if *server_nonce == self.last_nonce {
            &mut self.last_table
        } else {
            return Err(SolutionError::InvalidServerNonce);
        };
        if !Self::check_one_solution(
            solution,
            client_nonce,
            server_nonce,
            puzzle_difficulty,
            client_identity,
        ) {
            return Err(SolutionError::InvalidSolution);
        }
        if !table.check_add(client_nonce) {
            return Err(SolutionError::InvalidClientNonce);
        }
        Ok(())
    }

    /// Advances the brute-force search from `*solution`, returning true once a valid
    /// solution is found. Work is bounded per call (iteration batches against a
    /// millisecond budget); callers resume from the updated `*solution` next tick.
    pub fn solve_puzzle(
        solution: &mut u32,
        client_nonce: &Nonce,
        server_nonce: &Nonce,
        puzzle_difficulty: u32,
        client_identity: u32,
    ) -> bool {
        let start_time = time::clock_millis();
        let mut value = *solution;

        loop {
            let batch_end = value.wrapping_add(SOLUTION_FRAGMENT_ITERATIONS);
            while value != batch_end {
                if Self::check_one_solution(
                    value,
                    client_nonce,
                    server_nonce,
                    puzzle_difficulty,
                    client_identity,
                ) {
                    *solution = value;
                    return true;
                }
                value = value.wrapping_add(1);
            }
            if time::clock_millis().saturating_sub(start_time) > MAX_SOLUTION_COMPUTE_FRAGMENT {
                *solution = value;
                return false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_DIFFICULTY: u32 = 4;

    fn manager_with_difficulty(difficulty: u32) -> ClientPuzzleManager {
        let mut manager = ClientPuzzleManager::new();
        manager.current_difficulty = difficulty;
        manager
    }

    fn solve(manager: &ClientPuzzleManager, client_nonce: &Nonce, identity: u32) -> u32 {
        let server_nonce = manager.current_nonce();
        let mut solution = 0;
        while !ClientPuzzleManager::solve_puzzle(
            &mut solution,
            client_nonce,
            &server_nonce,
            manager.current_difficulty(),
            identity,
        ) {}
        solution
    }

    #[test]
    fn test_solution_accepted_once() {
        let mut manager = manager_with_difficulty(TEST_DIFFICULTY);
        let client_nonce = Nonce::random();
        let server_nonce = manager.current_nonce();
        let solution = solve(&manager, &client_nonce, 0x1234);

        assert_eq!(
            manager.check_solution(solution, &client_nonce, &server_nonce, TEST_DIFFICULTY, 0x1234),
            Ok(())
        );
        // replay of the same (client nonce, server nonce) pair is refused
        assert_eq!(
            manager.check_solution(solution, &client_nonce, &server_nonce, TEST_DIFFICULTY, 0x1234),
            Err(SolutionError::InvalidClientNonce)
        );
    }

    #[test]
    fn test_bogus_solution_rejected() {
        let mut manager = manager_with_difficulty(TEST_DIFFICULTY);
        let client_nonce = Nonce::random();
        let server_nonce = manager.current_nonce();
        let solution = solve(&manager, &client_nonce, 0x1234);

        // flipping the identity invalidates the pre-image
        assert_eq!(
            manager.check_solution(solution, &client_nonce, &server_nonce, TEST_DIFFICULTY, 0x4321),
            Err(SolutionError::InvalidSolution)
        );
    }

    #[test]
    fn test_difficulty_must_match() {
        let mut manager = manager_with_difficulty(TEST_DIFFICULTY);
        let client_nonce = Nonce::random();
        let server_nonce = manager.current_nonce();
        let solution = solve(&manager, &client_nonce, 7);

        assert_eq!(
            manager.check_solution(solution, &client_nonce, &server_nonce, TEST_DIFFICULTY + 1, 7),
            Err(SolutionError::InvalidPuzzleDifficulty)
        );
    }

    #[test]
    fn test_previous_nonce_valid_until_second_rotation() {
        let mut manager = manager_with_difficulty(TEST_DIFFICULTY);
        let client_nonce = Nonce::random();
        let server_nonce = manager.current_nonce();
        let solution = solve(&manager, &client_nonce, 9);

        // one rotation: the old nonce is now "previous" and still redeemable
        manager.tick(PUZZLE_REFRESH_TIME + 1);
        assert_eq!(
            manager.check_solution(solution, &client_nonce, &server_nonce, TEST_DIFFICULTY, 9),
            Ok(())
        );

        // a second rotation ages it out entirely
        manager.tick((PUZZLE_REFRESH_TIME + 1) * 2);
        assert_eq!(
            manager.check_solution(solution, &client_nonce, &server_nonce, TEST_DIFFICULTY, 9),
            Err(SolutionError::InvalidServerNonce)
        );
    }

    #[test]
    fn test_rotation_clears_redeemed_nonces() {
        let mut manager = manager_with_difficulty(TEST_DIFFICULTY);
        let client_nonce = Nonce::random();
        let first_server_nonce = manager.current_nonce();
        let solution = solve(&manager, &client_nonce, 3);
        assert_eq!(
            manager.check_solution(solution, &client_nonce, &first_server_nonce, TEST_DIFFICULTY, 3),
            Ok(())
        );

        // two rotations later the same client nonce may redeem against the new puzzle
        manager.tick(PUZZLE_REFRESH_TIME + 1);
        manager.tick((PUZZLE_REFRESH_TIME + 1) * 2);
        let new_solution = solve(&manager, &client_nonce, 3);
        assert_eq!(
            manager.check_solution(
                new_solution,
                &client_nonce,
                &manager.current_nonce(),
                TEST_DIFFICULTY,
                3
            ),
            Ok(())
        );
    }
}

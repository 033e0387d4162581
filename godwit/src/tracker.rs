//! Per-thread retention of the last error seen for each database.
//!
//! Keyed by (database, calling thread); bounded per thread so processes that
//! spin up many ephemeral threads touching many databases cannot grow the
//! map without limit.

use std::cell::RefCell;

use godwit_result::Error;

const PER_THREAD_CAP: usize = 16;

thread_local! {
    static LAST_ERRORS: RefCell<Vec<(u64, Error)>> = const { RefCell::new(Vec::new()) };
}

/// Remember `error` as the last error of `database_id` on this thread.
pub(crate) fn record(database_id: u64, error: &Error) {
    LAST_ERRORS.with(|cell| {
        let mut entries = cell.borrow_mut();
        entries.retain(|(id, _)| *id != database_id);
        entries.push((database_id, error.clone()));
        if entries.len() > PER_THREAD_CAP {
            // Oldest-touched entry goes first.
            entries.remove(0);
        }
    });
}

/// The last error of `database_id` on the calling thread, if any.
pub(crate) fn last_error(database_id: u64) -> Option<Error> {
    LAST_ERRORS.with(|cell| {
        cell.borrow()
            .iter()
            .rev()
            .find(|(id, _)| *id == database_id)
            .map(|(_, error)| error.clone())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use godwit_result::Code;

    #[test]
    fn records_per_database_and_evicts_oldest() {
        for id in 0..(PER_THREAD_CAP as u64 + 4) {
            record(id, &Error::new(Code::Busy, format!("db {id}")));
        }
        // The oldest entries were evicted; the newest survive.
        assert!(last_error(0).is_none());
        assert!(last_error(PER_THREAD_CAP as u64 + 3).is_some());

        record(7, &Error::new(Code::Constraint, "newer"));
        assert_eq!(last_error(7).unwrap().code, Code::Constraint);
    }

    #[test]
    fn other_threads_see_their_own_slot() {
        record(99, &Error::new(Code::Busy, "main thread"));
        std::thread::spawn(|| {
            assert!(last_error(99).is_none());
        })
        .join()
        .unwrap();
        assert!(last_error(99).is_some());
    }
}

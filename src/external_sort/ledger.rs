use crate::external_sort::constants::LEDGER_INITIAL_RUNS;
use crate::external_sort::error::{Result, SortError};

/// Page counts of the runs stored in one temp file, oldest first.
///
/// Consumed runs slide out of the live window `first_run..=last_run` but stay
/// in the backing vector until [`RunLedger::clear`].
#[derive(Debug, Clone)]
pub struct RunLedger {
    pages: Vec<usize>,
    first_run: Option<usize>,
}

impl Default for RunLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl RunLedger {
    pub fn new() -> Self {
        Self {
            pages: Vec::with_capacity(LEDGER_INITIAL_RUNS),
            first_run: None,
        }
    }

    pub fn add_run(&mut self, pages: usize) -> Result<()> {
        if pages == 0 {
            return Err(SortError::Internal("run with zero pages"));
        }
        self.pages
            .try_reserve(1)
            .map_err(|_| SortError::OutOfMemory { bytes: std::mem::size_of::<usize>() })?;
        self.pages.push(pages);
        if self.first_run.is_none() {
            self.first_run = Some(self.pages.len() - 1);
        }
        Ok(())
    }

    pub fn remove_first(&mut self) {
        if let Some(first) = self.first_run {
            self.first_run = if first + 1 < self.pages.len() {
                Some(first + 1)
            } else {
                None
            };
        }
    }

    pub fn run_count(&self) -> usize {
        self.first_run.map_or(0, |first| self.pages.len() - first)
    }

    pub fn is_empty(&self) -> bool {
        self.first_run.is_none()
    }

    pub fn first_run_pages(&self) -> Option<usize> {
        self.first_run.map(|first| self.pages[first])
    }

    pub fn live_runs(&self) -> &[usize] {
        match self.first_run {
            Some(first) => &self.pages[first..],
            None => &[],
        }
    }

    pub fn total_pages(&self) -> usize {
        self.live_runs().iter().sum()
    }

    pub fn clear(&mut self) {
        self.pages.clear();
        self.first_run = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sliding_window() {
        let mut ledger = RunLedger::new();
        assert!(ledger.is_empty());
        assert_eq!(ledger.first_run_pages(), None);

        ledger.add_run(3).unwrap();
        ledger.add_run(1).unwrap();
        assert_eq!(ledger.run_count(), 2);
        assert_eq!(ledger.total_pages(), 4);

        ledger.remove_first();
        assert_eq!(ledger.first_run_pages(), Some(1));
        ledger.remove_first();
        assert!(ledger.is_empty());
        ledger.remove_first();
        assert_eq!(ledger.run_count(), 0);

        ledger.add_run(2).unwrap();
        assert_eq!(ledger.live_runs(), &[2]);
    }

    #[test]
    fn test_rejects_empty_run() {
        let mut ledger = RunLedger::new();
        assert!(ledger.add_run(0).is_err());
    }
}

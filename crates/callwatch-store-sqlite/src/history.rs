use callwatch_core::{CallRecord, HistoryOptions, Result};

use crate::SqliteCallStore;

impl SqliteCallStore {
    /// Closed incidents matching `options`, newest creation first.
    ///
    /// Each call recomputes from the table; there is no cursor. An inverted
    /// range yields an empty result rather than an error.
    pub fn query_history(&self, options: &HistoryOptions) -> Result<Vec<CallRecord>> {
        if let (Some(start), Some(end)) = (options.start_date, options.end_date) {
            if start > end {
                return Ok(Vec::new());
            }
        }

        let candidates = if options.has_range() {
            self.query_by_creation_range(options.start_date, options.end_date)?
        } else {
            self.get_all()?
        };

        Ok(options.apply(candidates))
    }
}

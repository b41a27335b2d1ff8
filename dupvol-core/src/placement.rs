//! Spreads uploaded volumes over numbered subfolders so no folder grows too large.

use std::sync::{Mutex, PoisonError};

use crate::config::VolumeOptions;

/// Thread-safe counter that assigns each name to a folder holding at most
/// `files_per_folder` names.
#[derive(Debug)]
pub struct SubfolderPlacement {
    files_per_folder: u64,
    placed: Mutex<u64>,
}

impl SubfolderPlacement {
    /// `files_per_folder` of zero is treated as one.
    pub fn new(files_per_folder: u64) -> Self {
        Self { files_per_folder: files_per_folder.max(1), placed: Mutex::new(0) }
    }

    pub fn from_options(options: &VolumeOptions) -> Self {
        Self::new(options.files_per_folder)
    }

    /// Reserve the next slot and return `"<folder>/<name>"`.
    pub fn place(&self, name: &str) -> String {
        let mut placed = self.placed.lock().unwrap_or_else(PoisonError::into_inner);
        let folder = *placed / self.files_per_folder;
        *placed += 1;
        format!("{folder}/{name}")
    }

    /// Names placed so far.
    pub fn placed(&self) -> u64 {
        *self.placed.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;

    #[test]
    fn folders_fill_in_order() {
        let p = SubfolderPlacement::new(2);
        let got: Vec<_> = ["a", "b", "c", "d", "e"].iter().map(|n| p.place(n)).collect();
        assert_eq!(got, ["0/a", "0/b", "1/c", "1/d", "2/e"]);
    }

    #[test]
    fn concurrent_callers_never_overfill_a_folder() {
        let p = Arc::new(SubfolderPlacement::new(10));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let p = Arc::clone(&p);
                std::thread::spawn(move || {
                    (0..25).map(|i| p.place(&format!("{t}-{i}"))).collect::<Vec<_>>()
                })
            })
            .collect();
        let mut per_folder: HashMap<String, usize> = HashMap::new();
        for h in handles {
            for placed in h.join().unwrap() {
                let folder = placed.split('/').next().unwrap().to_string();
                *per_folder.entry(folder).or_default() += 1;
            }
        }
        assert_eq!(p.placed(), 200);
        assert_eq!(per_folder.len(), 20);
        assert!(per_folder.values().all(|&n| n == 10));
    }
}

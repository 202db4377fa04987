use alloy::primitives::U256;
use shielded_wallet_lib::Note;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SelectedNotes {
    pub notes: Vec<Note>,
    /// May exceed the target. Below it when funds are insufficient.
    pub total: U256,
}

impl SelectedNotes {
    pub fn covers(&self, target: U256) -> bool {
        self.total >= target
    }
}

/// Picks which unspent notes fund a payment. Candidates are already
/// filtered to one token and to unspent notes.
pub trait NoteSelector: Send + Sync {
    fn select(&self, candidates: &[Note], target: U256) -> SelectedNotes;
}

/// Greedy largest-first: sort descending by amount (ties keep their
/// stored order) and take notes until the running total reaches the target.
#[derive(Clone, Copy, Debug, Default)]
pub struct LargestFirst;

impl NoteSelector for LargestFirst {
    fn select(&self, candidates: &[Note], target: U256) -> SelectedNotes {
        let mut sorted: Vec<&Note> = candidates.iter().collect();
        sorted.sort_by(|a, b| b.amount.cmp(&a.amount));

        let mut selected = SelectedNotes::default();
        for note in sorted {
            if selected.total >= target {
                break;
            }
            selected.total = selected.total.saturating_add(note.amount);
            selected.notes.push(note.clone());
        }
        selected
    }
}

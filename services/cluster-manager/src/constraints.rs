//! Placement constraints derived from the job model.

use std::collections::HashMap;

use rivulet_id::ProcessorId;

/// For each processor, the family members (its active plus all
/// standbys) that must never share a host with it.
///
/// Families partition the processor-ID space; the table is symmetric
/// and read-only after construction. Sibling lists are sorted so that
/// every scan over them is deterministic and repeated failover attempts
/// are reproducible.
pub struct PlacementConstraints {
    siblings: HashMap<ProcessorId, Vec<ProcessorId>>,
}

impl PlacementConstraints {
    /// Build the table from the full processor list of the job model.
    pub fn from_processors(processors: &[ProcessorId]) -> Self {
        let mut families: HashMap<ProcessorId, Vec<ProcessorId>> = HashMap::new();
        for processor in processors {
            families
                .entry(processor.active_id())
                .or_default()
                .push(processor.clone());
        }

        let mut siblings = HashMap::new();
        for members in families.into_values() {
            let mut sorted = members;
            sorted.sort();
            for processor in &sorted {
                let others: Vec<ProcessorId> = sorted
                    .iter()
                    .filter(|other| *other != processor)
                    .cloned()
                    .collect();
                siblings.insert(processor.clone(), others);
            }
        }
        Self { siblings }
    }

    /// Sorted family members of `processor`, excluding itself. Empty
    /// for processors outside the job model.
    pub fn siblings(&self, processor: &ProcessorId) -> &[ProcessorId] {
        self.siblings
            .get(processor)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

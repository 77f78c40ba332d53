use super::mixture::Mixture;
use super::snapshot::{PhaseRecord, ProjectSnapshot, RuntimeSettings, SnapshotDecodeError};
use super::MixtureProject;
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq)]
pub struct PooledPhase {
    pub id: usize,
    pub name: String,
}

/// UUID registry for objects decoded from one snapshot.
#[derive(Debug, Default)]
pub struct ObjectPool {
    phases: HashMap<String, PooledPhase>,
}

impl ObjectPool {
    pub fn register(&mut self, uuid: &str, name: &str) -> Result<usize, SnapshotDecodeError> {
        if self.phases.contains_key(uuid) {
            return Err(SnapshotDecodeError::DuplicateUuid {
                uuid: uuid.to_string(),
            });
        }
        let id = self.phases.len();
        self.phases.insert(
            uuid.to_string(),
            PooledPhase {
                id,
                name: name.to_string(),
            },
        );
        Ok(id)
    }

    pub fn resolve(&self, uuid: &str) -> Option<&PooledPhase> {
        self.phases.get(uuid)
    }

    pub fn len(&self) -> usize {
        self.phases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }

    pub fn clear(&mut self) {
        self.phases.clear();
    }
}

/// Decoding state owned by a single load: the object pool and the runtime settings
/// read from the snapshot. Nothing outlives the context, so concurrent loads never
/// share identities.
#[derive(Debug, Default)]
pub struct DecodeContext {
    settings: RuntimeSettings,
    pool: ObjectPool,
}

impl DecodeContext {
    pub fn new(settings: RuntimeSettings) -> Self {
        Self {
            settings,
            pool: ObjectPool::default(),
        }
    }

    pub fn settings(&self) -> &RuntimeSettings {
        &self.settings
    }

    pub fn set_settings(&mut self, settings: RuntimeSettings) {
        self.settings = settings;
    }

    pub fn pool(&self) -> &ObjectPool {
        &self.pool
    }

    pub fn register_phase(&mut self, phase: &PhaseRecord) -> Result<usize, SnapshotDecodeError> {
        self.pool.register(&phase.uuid, &phase.name)
    }

    /// Forgets every registered identity and restores default settings.
    pub fn reset(&mut self) {
        self.pool.clear();
        self.settings = RuntimeSettings::default();
    }
}

pub fn decode_project(
    snapshot: ProjectSnapshot,
    context: &mut DecodeContext,
) -> Result<MixtureProject, SnapshotDecodeError> {
    context.set_settings(snapshot.settings);
    for phase in &snapshot.phases {
        context.register_phase(phase)?;
    }

    let mut mixtures = Vec::with_capacity(snapshot.mixtures.len());
    for mixture in snapshot.mixtures {
        mixtures.push(Mixture::decode(mixture, context)?);
    }

    tracing::debug!(
        project = %snapshot.name,
        phases = context.pool().len(),
        mixtures = mixtures.len(),
        "decoded project snapshot"
    );
    Ok(MixtureProject::new(snapshot.name, snapshot.phases, mixtures))
}

#[cfg(test)]
mod tests {
    use super::{DecodeContext, ObjectPool, decode_project};
    use crate::project::residual::ResidualKind;
    use crate::project::snapshot::{ProjectSnapshot, SnapshotDecodeError};

    const SNAPSHOT: &str = r#"{
        "name": "clay",
        "settings": { "residualKind": "rwp" },
        "phases": [
            { "uuid": "p-1", "name": "Illite" },
            { "uuid": "p-2", "name": "Smectite" }
        ],
        "mixtures": [{
            "name": "bulk",
            "phases": ["p-2", "p-1"],
            "fractions": [0.4, 0.6],
            "specimens": [{
                "twoTheta": [5.0, 6.0],
                "experimental": [1.0, 1.0],
                "profiles": [[1.0, 1.0], [1.0, 1.0]]
            }]
        }]
    }"#;

    #[test]
    fn pool_rejects_duplicate_uuids() {
        let mut pool = ObjectPool::default();
        assert_eq!(pool.register("p-1", "Illite").expect("first"), 0);
        assert!(matches!(
            pool.register("p-1", "Illite again"),
            Err(SnapshotDecodeError::DuplicateUuid { uuid }) if uuid == "p-1"
        ));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn decoding_resolves_phase_references_through_the_pool() {
        let snapshot = ProjectSnapshot::from_slice(SNAPSHOT.as_bytes()).expect("snapshot");
        let mut context = DecodeContext::default();
        let project = decode_project(snapshot, &mut context).expect("project");

        let mixture = project.mixture(0).expect("mixture");
        let ids: Vec<usize> = mixture.phases().iter().map(|phase| phase.id).collect();
        assert_eq!(ids, vec![1, 0]);
        assert_eq!(mixture.phases()[0].name, "Smectite");
        assert_eq!(mixture.residual_kind(), ResidualKind::Rwp);
        assert_eq!(context.settings().residual_kind, ResidualKind::Rwp);
    }

    #[test]
    fn separate_contexts_do_not_share_identities() {
        let mut first = DecodeContext::default();
        let mut second = DecodeContext::default();
        for context in [&mut first, &mut second] {
            let snapshot = ProjectSnapshot::from_slice(SNAPSHOT.as_bytes()).expect("snapshot");
            decode_project(snapshot, context).expect("each context decodes independently");
        }

        let snapshot = ProjectSnapshot::from_slice(SNAPSHOT.as_bytes()).expect("snapshot");
        assert!(matches!(
            decode_project(snapshot, &mut first),
            Err(SnapshotDecodeError::DuplicateUuid { .. })
        ));

        first.reset();
        assert!(first.pool().is_empty());
        assert_eq!(first.settings().residual_kind, ResidualKind::Rp);
    }
}

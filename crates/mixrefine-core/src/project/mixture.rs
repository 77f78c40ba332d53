use super::RefinableMixture;
use super::decode::DecodeContext;
use super::residual::ResidualKind;
use super::snapshot::{
    MixtureRecord, ParameterRecord, ParameterTarget, SnapshotDecodeError, SpecimenRecord,
};
use crate::domain::{ParameterRange, RefineError, RefineResult, SolutionVector};
use crate::refine::RefinementContext;
use faer::{Col, Mat};

const FRACTION_RANGE: ParameterRange = (0.0, 1.0);
const DEFAULT_SCALE_RANGE: ParameterRange = (0.0, f64::INFINITY);
const DEFAULT_BGSHIFT_RANGE: ParameterRange = (f64::NEG_INFINITY, f64::INFINITY);

#[derive(Debug, Clone, PartialEq)]
pub struct MixturePhase {
    /// Index of the phase in the owning project.
    pub id: usize,
    pub uuid: String,
    pub name: String,
}

/// Refinable parameter of a mixture, in solution order.
#[derive(Debug, Clone, PartialEq)]
pub struct Refinable {
    pub name: String,
    pub target: ParameterTarget,
    pub range: ParameterRange,
}

#[derive(Debug, Clone)]
pub struct Specimen {
    name: String,
    two_theta: Vec<f64>,
    experimental: Vec<f64>,
    /// Rows are 2θ points, columns are mixture phases.
    profiles: Mat<f64>,
    weights: Option<Vec<f64>>,
    refine_scale: bool,
    refine_bgshift: bool,
    scale_range: ParameterRange,
    bgshift_range: ParameterRange,
}

impl Specimen {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn two_theta(&self) -> &[f64] {
        &self.two_theta
    }

    pub fn experimental(&self) -> &[f64] {
        &self.experimental
    }

    pub fn point_count(&self) -> usize {
        self.profiles.nrows()
    }

    /// `scale * Σ_p fraction_p * profile_p + bgshift` at every 2θ point.
    pub fn calculated_pattern(&self, fractions: &[f64], scale: f64, bgshift: f64) -> Vec<f64> {
        let weights = Col::from_fn(self.profiles.ncols(), |column| {
            fractions.get(column).copied().unwrap_or(0.0)
        });
        let mixed = &self.profiles * &weights;
        (0..mixed.nrows())
            .map(|row| scale * mixed[row] + bgshift)
            .collect()
    }

    fn decode(
        record: SpecimenRecord,
        phase_count: usize,
        mixture: &str,
    ) -> Result<(Self, f64, f64), SnapshotDecodeError> {
        let context = format!("mixture '{mixture}' specimen '{}'", record.name);
        let points = record.two_theta.len();
        check_finite(&format!("{context} twoTheta"), &record.two_theta)?;
        check_len(&format!("{context} experimental"), points, record.experimental.len())?;
        check_finite(&format!("{context} experimental"), &record.experimental)?;
        check_len(&format!("{context} profiles"), phase_count, record.profiles.len())?;

        let mut profiles = Mat::<f64>::zeros(points, phase_count);
        for (column, profile) in record.profiles.iter().enumerate() {
            let profile_context = format!("{context} profile {column}");
            check_len(&profile_context, points, profile.len())?;
            check_finite(&profile_context, profile)?;
            for (row, &value) in profile.iter().enumerate() {
                profiles[(row, column)] = value;
            }
        }

        if let Some(weights) = &record.weights {
            check_len(&format!("{context} weights"), points, weights.len())?;
            check_finite(&format!("{context} weights"), weights)?;
        }
        check_finite(&format!("{context} scale"), &[record.scale, record.bgshift])?;
        let scale_range = decode_range(
            &format!("{context} scaleRange"),
            record.scale_range,
            DEFAULT_SCALE_RANGE,
        )?;
        let bgshift_range = decode_range(
            &format!("{context} bgshiftRange"),
            record.bgshift_range,
            DEFAULT_BGSHIFT_RANGE,
        )?;

        let specimen = Self {
            name: record.name,
            two_theta: record.two_theta,
            experimental: record.experimental,
            profiles,
            weights: record.weights,
            refine_scale: record.refine_scale,
            refine_bgshift: record.refine_bgshift,
            scale_range,
            bgshift_range,
        };
        Ok((specimen, record.scale, record.bgshift))
    }
}

/// Current values of every property a refinable parameter can target.
#[derive(Debug, Clone, PartialEq)]
struct MixtureValues {
    fractions: Vec<f64>,
    scales: Vec<f64>,
    bgshifts: Vec<f64>,
}

impl MixtureValues {
    fn slot(&mut self, target: ParameterTarget) -> Option<&mut f64> {
        match target {
            ParameterTarget::Fraction { phase } => self.fractions.get_mut(phase),
            ParameterTarget::Scale { specimen } => self.scales.get_mut(specimen),
            ParameterTarget::Bgshift { specimen } => self.bgshifts.get_mut(specimen),
        }
    }

    fn get(&self, target: ParameterTarget) -> Option<f64> {
        match target {
            ParameterTarget::Fraction { phase } => self.fractions.get(phase),
            ParameterTarget::Scale { specimen } => self.scales.get(specimen),
            ParameterTarget::Bgshift { specimen } => self.bgshifts.get(specimen),
        }
        .copied()
    }

    fn normalized_fractions(&self) -> Vec<f64> {
        let total: f64 = self.fractions.iter().sum();
        if total > 0.0 {
            self.fractions.iter().map(|fraction| fraction / total).collect()
        } else {
            vec![0.0; self.fractions.len()]
        }
    }
}

#[derive(Debug, Clone)]
pub struct Mixture {
    name: String,
    phases: Vec<MixturePhase>,
    values: MixtureValues,
    refine_fractions: bool,
    specimens: Vec<Specimen>,
    parameters: Vec<ParameterRecord>,
    residual_kind: ResidualKind,
    refinables: Vec<Refinable>,
    ranges: Vec<ParameterRange>,
}

impl Mixture {
    pub(crate) fn decode(
        record: MixtureRecord,
        context: &DecodeContext,
    ) -> Result<Self, SnapshotDecodeError> {
        let name = record.name;
        let mut phases = Vec::with_capacity(record.phases.len());
        for uuid in record.phases {
            let Some(phase) = context.pool().resolve(&uuid) else {
                return Err(SnapshotDecodeError::UnknownPhase {
                    mixture: name,
                    uuid,
                });
            };
            phases.push(MixturePhase {
                id: phase.id,
                name: phase.name.clone(),
                uuid,
            });
        }

        check_len(
            &format!("mixture '{name}' fractions"),
            phases.len(),
            record.fractions.len(),
        )?;
        check_finite(&format!("mixture '{name}' fractions"), &record.fractions)?;

        let mut specimens = Vec::with_capacity(record.specimens.len());
        let mut scales = Vec::with_capacity(record.specimens.len());
        let mut bgshifts = Vec::with_capacity(record.specimens.len());
        for specimen in record.specimens {
            let (specimen, scale, bgshift) = Specimen::decode(specimen, phases.len(), &name)?;
            specimens.push(specimen);
            scales.push(scale);
            bgshifts.push(bgshift);
        }

        let mut values = MixtureValues {
            fractions: record.fractions,
            scales,
            bgshifts,
        };
        for parameter in &record.parameters {
            let label = format!("mixture '{name}' parameter '{}'", parameter.name);
            check_range(&label, (parameter.min, parameter.max))?;
            let Some(slot) = values.slot(parameter.target) else {
                return Err(SnapshotDecodeError::UnknownTarget {
                    mixture: name.clone(),
                    parameter: parameter.name.clone(),
                    target: parameter.target,
                });
            };
            if let Some(value) = parameter.value {
                check_finite(&label, &[value])?;
                *slot = value;
            }
        }

        let mut mixture = Self {
            name,
            phases,
            values,
            refine_fractions: record.refine_fractions,
            specimens,
            parameters: record.parameters,
            residual_kind: context.settings().residual_kind,
            refinables: Vec::new(),
            ranges: Vec::new(),
        };
        mixture.rebuild_refinables();
        Ok(mixture)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn phases(&self) -> &[MixturePhase] {
        &self.phases
    }

    pub fn specimens(&self) -> &[Specimen] {
        &self.specimens
    }

    pub fn fractions(&self) -> &[f64] {
        &self.values.fractions
    }

    pub fn scales(&self) -> &[f64] {
        &self.values.scales
    }

    pub fn bgshifts(&self) -> &[f64] {
        &self.values.bgshifts
    }

    pub fn residual_kind(&self) -> ResidualKind {
        self.residual_kind
    }

    pub fn refinables(&self) -> &[Refinable] {
        &self.refinables
    }

    pub fn value_of(&self, target: ParameterTarget) -> Option<f64> {
        self.values.get(target)
    }

    /// Calculated pattern of one specimen using the mixture's current values.
    pub fn calculated_pattern(&self, specimen: usize) -> RefineResult<Vec<f64>> {
        let Some(data) = self.specimens.get(specimen) else {
            return Err(RefineError::not_found(
                "SPECIMEN.INDEX",
                format!(
                    "mixture '{}' has {} specimens, index {specimen} is out of range",
                    self.name,
                    self.specimens.len()
                ),
            ));
        };
        Ok(data.calculated_pattern(
            &self.values.normalized_fractions(),
            self.values.scales[specimen],
            self.values.bgshifts[specimen],
        ))
    }

    /// Residual of the mixture's current values.
    pub fn residual(&self) -> RefineResult<f64> {
        self.residual_of(&self.values)
    }

    fn residual_of(&self, values: &MixtureValues) -> RefineResult<f64> {
        if self.specimens.is_empty() {
            return Err(RefineError::invalid_state(
                "MIXTURE.NO_SPECIMENS",
                format!("mixture '{}' has no specimens to refine against", self.name),
            ));
        }

        let fractions = values.normalized_fractions();
        let mut total = 0.0;
        for (index, specimen) in self.specimens.iter().enumerate() {
            let (scale, bgshift) = (values.scales[index], values.bgshifts[index]);
            let calculated = specimen.calculated_pattern(&fractions, scale, bgshift);
            total += self.residual_kind.evaluate(
                &specimen.experimental,
                &calculated,
                specimen.weights.as_deref(),
            )?;
        }
        Ok(total / self.specimens.len() as f64)
    }

    fn values_with(&self, solution: &[f64]) -> RefineResult<MixtureValues> {
        if solution.len() != self.refinables.len() {
            return Err(RefineError::invalid_state(
                "MIXTURE.SOLUTION_SHAPE",
                format!(
                    "mixture '{}' has {} refinable parameters, solution has {}",
                    self.name,
                    self.refinables.len(),
                    solution.len()
                ),
            ));
        }
        let mut values = self.values.clone();
        for (refinable, &value) in self.refinables.iter().zip(solution) {
            if let Some(slot) = values.slot(refinable.target) {
                *slot = value;
            }
        }
        Ok(values)
    }

    fn default_refinables(&self) -> Vec<Refinable> {
        let mut refinables = Vec::new();
        if self.refine_fractions {
            for (phase, slot) in self.phases.iter().enumerate() {
                refinables.push(Refinable {
                    name: format!("{} fraction", display_name(&slot.name, &slot.uuid)),
                    target: ParameterTarget::Fraction { phase },
                    range: FRACTION_RANGE,
                });
            }
        }
        for (index, specimen) in self.specimens.iter().enumerate() {
            let label = display_name(&specimen.name, &format!("specimen {index}")).to_string();
            if specimen.refine_scale {
                refinables.push(Refinable {
                    name: format!("{label} scale"),
                    target: ParameterTarget::Scale { specimen: index },
                    range: specimen.scale_range,
                });
            }
            if specimen.refine_bgshift {
                refinables.push(Refinable {
                    name: format!("{label} bgshift"),
                    target: ParameterTarget::Bgshift { specimen: index },
                    range: specimen.bgshift_range,
                });
            }
        }
        refinables
    }
}

impl RefinableMixture for Mixture {
    type Context<'a>
        = &'a mut Mixture
    where
        Self: 'a;

    /// Derives the refinable list from the refine flags, then lets explicit
    /// parameter definitions rename, re-bound, add or disable entries.
    fn rebuild_refinables(&mut self) {
        let mut refinables = self.default_refinables();
        for parameter in &self.parameters {
            let position = refinables
                .iter()
                .position(|refinable| refinable.target == parameter.target);
            match (position, parameter.refine) {
                (Some(position), true) => {
                    let refinable = &mut refinables[position];
                    if !parameter.name.is_empty() {
                        refinable.name = parameter.name.clone();
                    }
                    refinable.range = (parameter.min, parameter.max);
                }
                (Some(position), false) => {
                    refinables.remove(position);
                }
                (None, true) => refinables.push(Refinable {
                    name: parameter.name.clone(),
                    target: parameter.target,
                    range: (parameter.min, parameter.max),
                }),
                (None, false) => {}
            }
        }

        self.ranges = refinables.iter().map(|refinable| refinable.range).collect();
        self.refinables = refinables;
        tracing::debug!(
            mixture = %self.name,
            parameters = self.refinables.len(),
            "rebuilt refinable parameters"
        );
    }

    fn refinement_context(&mut self) -> RefineResult<Self::Context<'_>> {
        if self.specimens.is_empty() {
            return Err(RefineError::invalid_state(
                "MIXTURE.NO_SPECIMENS",
                format!("mixture '{}' has no specimens to refine against", self.name),
            ));
        }
        Ok(self)
    }
}

impl RefinementContext for Mixture {
    fn ranges(&self) -> &[ParameterRange] {
        &self.ranges
    }

    fn residual_for_solution(&self, solution: &[f64]) -> RefineResult<f64> {
        let values = self.values_with(solution)?;
        self.residual_of(&values)
    }

    fn current_solution(&self) -> SolutionVector {
        self.refinables
            .iter()
            .map(|refinable| self.values.get(refinable.target).unwrap_or(f64::NAN))
            .collect()
    }

    fn apply_solution(&mut self, solution: &[f64]) -> RefineResult<()> {
        self.values = self.values_with(solution)?;
        tracing::debug!(mixture = %self.name, "applied solution to mixture");
        Ok(())
    }
}

fn display_name<'a>(name: &'a str, fallback: &'a str) -> &'a str {
    if name.is_empty() { fallback } else { name }
}

fn check_len(context: &str, expected: usize, actual: usize) -> Result<(), SnapshotDecodeError> {
    if expected == actual {
        Ok(())
    } else {
        Err(SnapshotDecodeError::Shape {
            context: context.to_string(),
            expected,
            actual,
        })
    }
}

fn check_finite(context: &str, values: &[f64]) -> Result<(), SnapshotDecodeError> {
    if values.iter().all(|value| value.is_finite()) {
        Ok(())
    } else {
        Err(SnapshotDecodeError::NonFinite {
            context: context.to_string(),
        })
    }
}

fn check_range(context: &str, (min, max): ParameterRange) -> Result<(), SnapshotDecodeError> {
    if min.is_nan() || max.is_nan() || min > max {
        return Err(SnapshotDecodeError::InvalidRange {
            context: context.to_string(),
            min,
            max,
        });
    }
    Ok(())
}

fn decode_range(
    context: &str,
    range: Option<[f64; 2]>,
    default: ParameterRange,
) -> Result<ParameterRange, SnapshotDecodeError> {
    let range = range.map_or(default, |[min, max]| (min, max));
    check_range(context, range)?;
    Ok(range)
}

#[cfg(test)]
mod tests {
    use super::Mixture;
    use crate::project::RefinableMixture;
    use crate::project::decode::DecodeContext;
    use crate::project::residual::ResidualKind;
    use crate::project::snapshot::{
        MixtureRecord, ParameterRecord, ParameterTarget, PhaseRecord, RuntimeSettings,
        SnapshotDecodeError, SpecimenRecord,
    };
    use crate::refine::RefinementContext;

    fn specimen(experimental: Vec<f64>, profiles: Vec<Vec<f64>>) -> SpecimenRecord {
        SpecimenRecord {
            name: "air-dried".to_string(),
            two_theta: (0..experimental.len()).map(|index| 5.0 + index as f64).collect(),
            experimental,
            profiles,
            scale: 1.0,
            bgshift: 0.0,
            refine_scale: true,
            refine_bgshift: false,
            scale_range: Some([0.0, 10.0]),
            bgshift_range: None,
            weights: None,
        }
    }

    fn record() -> MixtureRecord {
        MixtureRecord {
            name: "sample".to_string(),
            phases: vec!["p-1".to_string(), "p-2".to_string()],
            fractions: vec![0.5, 0.5],
            refine_fractions: true,
            specimens: vec![specimen(
                vec![3.0, 1.0, 2.0],
                vec![vec![4.0, 0.0, 2.0], vec![2.0, 2.0, 2.0]],
            )],
            parameters: Vec::new(),
        }
    }

    fn context() -> DecodeContext {
        let mut context = DecodeContext::new(RuntimeSettings::default());
        for (uuid, name) in [("p-1", "Illite"), ("p-2", "Kaolinite")] {
            context
                .register_phase(&PhaseRecord {
                    uuid: uuid.to_string(),
                    name: name.to_string(),
                })
                .expect("phase should register");
        }
        context
    }

    #[test]
    fn calculated_pattern_mixes_normalized_fractions() {
        let mut record = record();
        record.fractions = vec![1.0, 3.0];
        record.specimens[0].scale = 2.0;
        record.specimens[0].bgshift = 0.5;
        let mixture = Mixture::decode(record, &context()).expect("mixture should decode");

        let pattern = mixture.calculated_pattern(0).expect("pattern");
        assert_eq!(pattern, vec![5.5, 3.5, 4.5]);
    }

    #[test]
    fn missing_fractions_weigh_their_profiles_as_zero() {
        let mixture = Mixture::decode(record(), &context()).expect("mixture should decode");
        let specimen = &mixture.specimens()[0];

        assert_eq!(specimen.calculated_pattern(&[1.0], 1.0, 0.0), vec![4.0, 0.0, 2.0]);
        assert_eq!(specimen.calculated_pattern(&[], 3.0, 1.5), vec![1.5, 1.5, 1.5]);
    }

    #[test]
    fn matching_fractions_give_zero_residual() {
        let mixture = Mixture::decode(record(), &context()).expect("mixture should decode");
        assert_eq!(mixture.residual().expect("residual"), 0.0);
    }

    #[test]
    fn default_refinables_follow_refine_flags() {
        let mixture = Mixture::decode(record(), &context()).expect("mixture should decode");

        let names: Vec<&str> = mixture
            .refinables()
            .iter()
            .map(|refinable| refinable.name.as_str())
            .collect();
        assert_eq!(
            names,
            vec!["Illite fraction", "Kaolinite fraction", "air-dried scale"]
        );
        assert_eq!(mixture.ranges(), &[(0.0, 1.0), (0.0, 1.0), (0.0, 10.0)]);
        assert_eq!(mixture.current_solution(), vec![0.5, 0.5, 1.0]);
    }

    #[test]
    fn explicit_parameters_override_add_and_disable_refinables() {
        let mut record = record();
        record.parameters = vec![
            ParameterRecord {
                name: "illite".to_string(),
                target: ParameterTarget::Fraction { phase: 0 },
                value: Some(0.25),
                min: 0.1,
                max: 0.9,
                refine: true,
            },
            ParameterRecord {
                name: String::new(),
                target: ParameterTarget::Fraction { phase: 1 },
                value: None,
                min: 0.0,
                max: 1.0,
                refine: false,
            },
            ParameterRecord {
                name: "background".to_string(),
                target: ParameterTarget::Bgshift { specimen: 0 },
                value: Some(-1.0),
                min: -5.0,
                max: 5.0,
                refine: true,
            },
        ];
        let mixture = Mixture::decode(record, &context()).expect("mixture should decode");

        assert_eq!(mixture.ranges(), &[(0.1, 0.9), (0.0, 10.0), (-5.0, 5.0)]);
        assert_eq!(mixture.current_solution(), vec![0.25, 1.0, -1.0]);
        assert_eq!(mixture.refinables()[0].name, "illite");
    }

    #[test]
    fn residual_for_solution_leaves_values_untouched_until_applied() {
        let mut mixture = Mixture::decode(record(), &context()).expect("mixture should decode");
        let trial = [0.5, 0.5, 2.0];

        let residual = mixture.residual_for_solution(&trial).expect("residual");
        assert!(residual > 0.0);
        assert_eq!(mixture.scales(), &[1.0]);

        mixture.apply_solution(&trial).expect("apply");
        assert_eq!(mixture.scales(), &[2.0]);
        assert_eq!(mixture.residual().expect("residual"), residual);
    }

    #[test]
    fn solution_shape_is_checked() {
        let mixture = Mixture::decode(record(), &context()).expect("mixture should decode");
        let error = mixture
            .residual_for_solution(&[0.5])
            .expect_err("short solution");
        assert_eq!(error.code(), "MIXTURE.SOLUTION_SHAPE");
    }

    #[test]
    fn weighted_residual_uses_project_setting() {
        let mut context = context();
        context.set_settings(RuntimeSettings {
            residual_kind: ResidualKind::Rwp,
        });
        let mut record = record();
        record.specimens[0].weights = Some(vec![1.0, 1.0, 1.0]);
        let mut mixture = Mixture::decode(record, &context).expect("mixture should decode");

        assert_eq!(mixture.residual_kind(), ResidualKind::Rwp);
        mixture.apply_solution(&[0.5, 0.5, 0.0]).expect("apply");
        assert!((mixture.residual().expect("residual") - 100.0).abs() < 1.0e-12);
    }

    #[test]
    fn decode_rejects_inconsistent_records() {
        let mut unknown = record();
        unknown.phases[1] = "p-9".to_string();
        assert!(matches!(
            Mixture::decode(unknown, &context()),
            Err(SnapshotDecodeError::UnknownPhase { uuid, .. }) if uuid == "p-9"
        ));

        let mut short_profile = record();
        short_profile.specimens[0].profiles[1].pop();
        assert!(matches!(
            Mixture::decode(short_profile, &context()),
            Err(SnapshotDecodeError::Shape {
                expected: 3,
                actual: 2,
                ..
            })
        ));

        let mut bad_target = record();
        bad_target.parameters.push(ParameterRecord {
            name: "ghost".to_string(),
            target: ParameterTarget::Scale { specimen: 4 },
            value: None,
            min: 0.0,
            max: 1.0,
            refine: true,
        });
        assert!(matches!(
            Mixture::decode(bad_target, &context()),
            Err(SnapshotDecodeError::UnknownTarget { .. })
        ));
    }

    #[test]
    fn mixtures_without_specimens_cannot_be_refined() {
        let mut record = record();
        record.specimens.clear();
        let mut mixture = Mixture::decode(record, &context()).expect("mixture should decode");
        let error = mixture.refinement_context().expect_err("no specimens");
        assert_eq!(error.code(), "MIXTURE.NO_SPECIMENS");
    }
}

//! Tau-leaping stochastic simulation of discrete chemical reaction networks.
//!
//! Given a stoichiometry table, per-reaction kinetics and a time horizon, the
//! engine samples trajectories of the underlying continuous-time Markov jump
//! process. Instead of simulating one reaction event at a time, each step
//! advances by an adaptively chosen leap during which firing counts are drawn
//! from Poisson distributions, falling back to exact single-reaction stepping
//! whenever the leap would degenerate. Trajectories are independent and run
//! in parallel, each with its own deterministically derived RNG.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::{Duration, Instant};

use meval::{Context, ContextProvider, Expr};
use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Poisson};
use rayon::ThreadPoolBuilder;
use rayon::prelude::*;
use thiserror::Error;
use tracing::{debug, info, warn};

const TIME_EPSILON: f64 = 1e-12;

/// Default relative-change tolerance for leap selection.
pub const DEFAULT_EPSILON: f64 = 0.03;
/// Default firing-count threshold below which a reaction is critical.
pub const DEFAULT_CRITICAL_THRESHOLD: i32 = 10;
/// Default multiple of the mean inter-event time below which the engine
/// takes an exact step instead of leaping.
pub const DEFAULT_SSA_FALLBACK_MULTIPLE: f64 = 10.0;
/// Default number of leap halvings tried before an exact step is forced.
pub const DEFAULT_MAX_LEAP_RETRIES: u32 = 10;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum SimError {
    #[error("shape mismatch: {0}")]
    Shape(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("reaction {reaction} propensity evaluated to {value} at t = {time}")]
    InvalidPropensity {
        reaction: usize,
        value: f64,
        time: f64,
    },
    #[error("no reaction can fire without driving a population negative at t = {time}")]
    Degenerate { time: f64 },
    #[error("thread pool error: {0}")]
    ThreadPool(String),
}

/// Named numeric constant available to rate constants and expression
/// propensities. Immutable for the duration of a run, except through the
/// per-run override map consumed before any trajectory starts.
#[derive(Clone, Debug, PartialEq)]
pub struct Parameter {
    pub name: String,
    pub value: f64,
}

impl Parameter {
    pub fn new(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

/// Rate constant of a reaction: either a literal or a named parameter
/// resolved at run start (after overrides are applied).
#[derive(Clone, Debug, PartialEq)]
pub enum RateConstant {
    Literal(f64),
    Parameter(String),
}

/// Kinetic law of a reaction. The propensity is the resolved rate constant
/// multiplied by the law's value at the current populations.
#[derive(Clone, Debug, PartialEq)]
pub enum Kinetics {
    /// Rate constant times the falling factorial of each reactant count.
    MassAction,
    /// Hill activation: `x^n / (K^n + x^n)` of the activator species.
    Hill {
        activator: usize,
        hill_n: f64,
        k_half: f64,
    },
    /// Michaelis-Menten saturation: `x / (k_m + x)` of the substrate.
    MichaelisMenten { substrate: usize, k_m: f64 },
    /// Arbitrary expression over species `s0..sN` and parameter names.
    Expression(String),
}

/// Reaction descriptor consumed by [`Model::new`].
#[derive(Clone, Debug, PartialEq)]
pub struct ReactionDef {
    pub rate: RateConstant,
    pub kinetics: Kinetics,
}

impl ReactionDef {
    pub fn mass_action(rate: f64) -> Self {
        Self {
            rate: RateConstant::Literal(rate),
            kinetics: Kinetics::MassAction,
        }
    }

    pub fn mass_action_param(name: impl Into<String>) -> Self {
        Self {
            rate: RateConstant::Parameter(name.into()),
            kinetics: Kinetics::MassAction,
        }
    }

    pub fn expression(expr: impl Into<String>) -> Self {
        Self {
            rate: RateConstant::Literal(1.0),
            kinetics: Kinetics::Expression(expr.into()),
        }
    }
}

#[derive(Clone, Debug)]
struct Reactant {
    species: usize,
    count: i32,
}

#[derive(Clone, Debug)]
struct SpeciesDelta {
    species: usize,
    delta: i32,
}

#[derive(Clone, Debug)]
enum CompiledKinetics {
    MassAction,
    Hill {
        activator: usize,
        hill_n: f64,
        k_half_pow_n: f64,
    },
    MichaelisMenten {
        substrate: usize,
        k_m: f64,
    },
    Expression {
        expr: Expr,
    },
}

#[derive(Clone, Debug)]
struct Reaction {
    rate: RateConstant,
    reactants: Vec<Reactant>,
    kinetics: CompiledKinetics,
}

/// Compiled, immutable model tables: stoichiometry, kinetics and parameters.
/// Shared by reference across all trajectory workers for the whole run.
#[derive(Clone, Debug)]
pub struct Model {
    n_species: usize,
    n_reactions: usize,
    reaction_deltas: Vec<Vec<SpeciesDelta>>,
    reactions: Vec<Reaction>,
    parameters: Vec<Parameter>,
}

impl Model {
    /// Compile a model from a reaction-major stoichiometry matrix
    /// (`reactions.len() * n_species` signed entries), reaction descriptors
    /// and a parameter table. This is the only fallible model-building step;
    /// all index, shape and kinetic-parameter validation happens here.
    pub fn new(
        n_species: usize,
        stoich: &[i32],
        reactions: Vec<ReactionDef>,
        parameters: Vec<Parameter>,
    ) -> Result<Self, SimError> {
        let n_reactions = reactions.len();
        if n_species == 0 || n_reactions == 0 {
            return Err(SimError::InvalidArgument(
                "model must contain at least one species and one reaction".into(),
            ));
        }
        if stoich.len() != n_reactions * n_species {
            return Err(SimError::Shape(format!(
                "stoichiometry length {} does not match {} reactions x {} species",
                stoich.len(),
                n_reactions,
                n_species
            )));
        }
        for param in &parameters {
            if parse_species_variable(&param.name).is_some() {
                return Err(SimError::InvalidArgument(format!(
                    "parameter name '{}' collides with the species variable namespace",
                    param.name
                )));
            }
            if !param.value.is_finite() {
                return Err(SimError::InvalidArgument(format!(
                    "parameter '{}' has non-finite value {}",
                    param.name, param.value
                )));
            }
        }

        let mut compiled = Vec::with_capacity(n_reactions);
        for (idx, (def, row)) in reactions
            .iter()
            .zip(stoich.chunks_exact(n_species))
            .enumerate()
        {
            if let RateConstant::Parameter(name) = &def.rate {
                if !parameters.iter().any(|p| &p.name == name) {
                    return Err(SimError::InvalidArgument(format!(
                        "reaction {} rate refers to unknown parameter '{}'",
                        idx, name
                    )));
                }
            }
            let reactants: Vec<_> = row
                .iter()
                .enumerate()
                .filter_map(|(species, &delta)| {
                    (delta < 0).then_some(Reactant {
                        species,
                        count: -delta,
                    })
                })
                .collect();
            let kinetics = CompiledKinetics::compile(&def.kinetics, idx, n_species)?;
            compiled.push(Reaction {
                rate: def.rate.clone(),
                reactants,
                kinetics,
            });
        }

        let reaction_deltas = build_reaction_deltas(n_species, stoich);

        Ok(Self {
            n_species,
            n_reactions,
            reaction_deltas,
            reactions: compiled,
            parameters,
        })
    }

    pub fn n_species(&self) -> usize {
        self.n_species
    }

    pub fn n_reactions(&self) -> usize {
        self.n_reactions
    }
}

impl CompiledKinetics {
    fn compile(kinetics: &Kinetics, reaction_idx: usize, n_species: usize) -> Result<Self, SimError> {
        match kinetics {
            Kinetics::MassAction => Ok(Self::MassAction),
            Kinetics::Hill {
                activator,
                hill_n,
                k_half,
            } => {
                if *activator >= n_species {
                    return Err(SimError::InvalidArgument(format!(
                        "reaction {} activator index {} exceeds number of species {}",
                        reaction_idx, activator, n_species
                    )));
                }
                if *hill_n <= 0.0 || *k_half <= 0.0 {
                    return Err(SimError::InvalidArgument(format!(
                        "reaction {} Hill parameters must be positive",
                        reaction_idx
                    )));
                }
                Ok(Self::Hill {
                    activator: *activator,
                    hill_n: *hill_n,
                    k_half_pow_n: k_half.powf(*hill_n),
                })
            }
            Kinetics::MichaelisMenten { substrate, k_m } => {
                if *substrate >= n_species {
                    return Err(SimError::InvalidArgument(format!(
                        "reaction {} substrate index {} exceeds number of species {}",
                        reaction_idx, substrate, n_species
                    )));
                }
                if *k_m <= 0.0 {
                    return Err(SimError::InvalidArgument(format!(
                        "reaction {} Michaelis-Menten k_m must be positive",
                        reaction_idx
                    )));
                }
                Ok(Self::MichaelisMenten {
                    substrate: *substrate,
                    k_m: *k_m,
                })
            }
            Kinetics::Expression(expr_str) => {
                let expr = Expr::from_str(expr_str).map_err(|err| {
                    SimError::InvalidArgument(format!(
                        "reaction {} expression parse error: {}",
                        reaction_idx, err
                    ))
                })?;
                validate_species_refs(expr_str, reaction_idx, n_species)?;
                Ok(Self::Expression { expr })
            }
        }
    }
}

fn build_reaction_deltas(n_species: usize, stoich: &[i32]) -> Vec<Vec<SpeciesDelta>> {
    stoich
        .chunks_exact(n_species)
        .map(|row| {
            row.iter()
                .enumerate()
                .filter_map(|(species, &delta)| {
                    (delta != 0).then_some(SpeciesDelta { species, delta })
                })
                .collect()
        })
        .collect()
}

/// Scan an expression string for `s<idx>` species variables and reject
/// indices outside the model. Other identifiers are left to evaluation,
/// where they resolve against the parameter table.
fn validate_species_refs(
    expr_str: &str,
    reaction_idx: usize,
    n_species: usize,
) -> Result<(), SimError> {
    let bytes = expr_str.as_bytes();
    let mut idx = 0;
    while idx < bytes.len() {
        let ch = bytes[idx];
        let at_word_start = idx == 0 || !bytes[idx - 1].is_ascii_alphanumeric();
        if (ch == b's' || ch == b'S') && at_word_start {
            let mut end = idx + 1;
            while end < bytes.len() && bytes[end].is_ascii_digit() {
                end += 1;
            }
            let word_ends = end >= bytes.len() || !bytes[end].is_ascii_alphanumeric();
            if end > idx + 1 && word_ends {
                let digits = &expr_str[idx + 1..end];
                let species_idx = digits.parse::<usize>().map_err(|_| {
                    SimError::InvalidArgument(format!(
                        "reaction {} expression contains invalid species index '{}'",
                        reaction_idx, digits
                    ))
                })?;
                if species_idx >= n_species {
                    return Err(SimError::InvalidArgument(format!(
                        "reaction {} expression species index {} exceeds number of species {}",
                        reaction_idx, species_idx, n_species
                    )));
                }
                idx = end;
                continue;
            }
        }
        idx += 1;
    }
    Ok(())
}

fn parse_species_variable(name: &str) -> Option<usize> {
    let digits = name.strip_prefix('s').or_else(|| name.strip_prefix('S'))?;
    if digits.is_empty() {
        return None;
    }
    digits.parse::<usize>().ok()
}

/// Resolved parameter values for one run (base values with overrides applied).
#[derive(Clone, Debug)]
struct ParamTable {
    names: Vec<String>,
    values: Vec<f64>,
}

impl ParamTable {
    fn resolve(model: &Model, overrides: &HashMap<String, f64>) -> Result<Self, SimError> {
        for name in overrides.keys() {
            if !model.parameters.iter().any(|p| &p.name == name) {
                return Err(SimError::InvalidArgument(format!(
                    "override refers to unknown parameter '{}'",
                    name
                )));
            }
        }
        let mut names = Vec::with_capacity(model.parameters.len());
        let mut values = Vec::with_capacity(model.parameters.len());
        for param in &model.parameters {
            let value = overrides.get(&param.name).copied().unwrap_or(param.value);
            if !value.is_finite() {
                return Err(SimError::InvalidArgument(format!(
                    "override for parameter '{}' is non-finite",
                    param.name
                )));
            }
            names.push(param.name.clone());
            values.push(value);
        }
        Ok(Self { names, values })
    }

    fn lookup(&self, name: &str) -> Option<f64> {
        self.names
            .iter()
            .position(|n| n == name)
            .map(|idx| self.values[idx])
    }
}

/// Variable scope for expression propensities: species `s<idx>` first, then
/// named parameters. Builtin functions come from the chained meval context.
struct EvalScope<'a> {
    state: &'a [i32],
    params: &'a ParamTable,
}

impl<'a> ContextProvider for EvalScope<'a> {
    fn get_var(&self, name: &str) -> Option<f64> {
        if let Some(idx) = parse_species_variable(name) {
            return self.state.get(idx).map(|&x| x.max(0) as f64);
        }
        self.params.lookup(name)
    }
}

impl Reaction {
    /// Instantaneous propensity at the given populations. Pure; returns NaN
    /// for unresolvable expressions so the caller reports a model fault.
    fn propensity(&self, rate_constant: f64, state: &[i32], params: &ParamTable) -> f64 {
        match self.kinetics {
            CompiledKinetics::MassAction => {
                let mut propensity = rate_constant;
                for reactant in &self.reactants {
                    let available = state[reactant.species];
                    if available < reactant.count {
                        return 0.0;
                    }
                    propensity *= falling_factorial(available, reactant.count);
                }
                propensity
            }
            CompiledKinetics::Hill {
                activator,
                hill_n,
                k_half_pow_n,
            } => {
                let concentration = state[activator].max(0) as f64;
                let power = concentration.powf(hill_n);
                let denom = k_half_pow_n + power;
                if denom == 0.0 {
                    0.0
                } else {
                    rate_constant * power / denom
                }
            }
            CompiledKinetics::MichaelisMenten { substrate, k_m } => {
                let substrate_count = state[substrate].max(0) as f64;
                let denom = k_m + substrate_count;
                if denom == 0.0 {
                    0.0
                } else {
                    rate_constant * substrate_count / denom
                }
            }
            CompiledKinetics::Expression { ref expr } => {
                let scope = (EvalScope { state, params }, Context::new());
                match expr.eval_with_context(scope) {
                    Ok(value) => rate_constant * value,
                    Err(_) => f64::NAN,
                }
            }
        }
    }
}

#[inline]
fn falling_factorial(value: i32, count: i32) -> f64 {
    match count {
        0 => 1.0,
        1 => value as f64,
        2 if value >= 2 => (value * (value - 1)) as f64,
        3 if value >= 3 => (value * (value - 1) * (value - 2)) as f64,
        _ if value < count => 0.0,
        _ => {
            let mut acc = 1.0;
            for i in 0..count {
                acc *= (value - i) as f64;
            }
            acc
        }
    }
}

/// Resume tail for one trajectory: the final time and population vector of a
/// previous partial run. Sampling continues from here instead of t = 0.
#[derive(Clone, Debug, PartialEq)]
pub struct Continuation {
    pub time: f64,
    pub state: Vec<i32>,
}

/// Run configuration. Tuning knobs carry documented defaults; construct with
/// [`RunConfig::new`] and adjust fields as needed.
#[derive(Clone, Debug)]
pub struct RunConfig {
    /// Simulation horizon.
    pub end_time: f64,
    /// Output sample spacing. The grid holds `round(end_time/increment) + 1`
    /// evenly spaced points starting at t = 0.
    pub increment: f64,
    /// Number of independent trajectories.
    pub trajectories: usize,
    /// Relative propensity-change tolerance for leap selection.
    pub epsilon: f64,
    /// Firing-count threshold below which a reaction is treated as critical.
    pub critical_threshold: i32,
    /// Exact-step fallback kicks in when the candidate leap is shorter than
    /// this multiple of the mean inter-event time.
    pub ssa_fallback_multiple: f64,
    /// Leap halvings attempted after a negative-population violation before
    /// an exact step is forced.
    pub max_leap_retries: u32,
    /// Base RNG seed. Absent means seeding from system entropy.
    pub seed: Option<u64>,
    /// Wall-clock budget; trajectories still running at the deadline are
    /// abandoned and reported as timed out.
    pub timeout: Option<Duration>,
    /// Worker thread bound for the trajectory pool.
    pub threads: Option<usize>,
    /// Per-run parameter overrides, applied by name before any trajectory.
    pub overrides: HashMap<String, f64>,
    /// Per-trajectory resume tails; length must equal `trajectories`.
    pub continuations: Option<Vec<Continuation>>,
}

impl RunConfig {
    pub fn new(end_time: f64, increment: f64) -> Self {
        Self {
            end_time,
            increment,
            trajectories: 1,
            epsilon: DEFAULT_EPSILON,
            critical_threshold: DEFAULT_CRITICAL_THRESHOLD,
            ssa_fallback_multiple: DEFAULT_SSA_FALLBACK_MULTIPLE,
            max_leap_retries: DEFAULT_MAX_LEAP_RETRIES,
            seed: None,
            timeout: None,
            threads: None,
            overrides: HashMap::new(),
            continuations: None,
        }
    }
}

/// Terminal state of one trajectory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrajectoryStatus {
    /// Reached the horizon with a full output grid.
    Completed,
    /// Abandoned at the run deadline; only `recorded` rows are meaningful.
    TimedOut,
    /// Aborted on a model fault; partial rows plus the fault are reported.
    Failed,
}

/// One trajectory's output: a row-major `i32` buffer with one row of species
/// populations per grid point.
#[derive(Clone, Debug)]
pub struct TrajectoryResult {
    pub states: Vec<i32>,
    pub final_time: f64,
    /// Number of grid rows actually recorded (equals the grid length for
    /// completed trajectories).
    pub recorded: usize,
    pub status: TrajectoryStatus,
    pub fault: Option<SimError>,
    n_species: usize,
}

impl TrajectoryResult {
    pub fn row(&self, step: usize) -> &[i32] {
        let start = step * self.n_species;
        &self.states[start..start + self.n_species]
    }
}

/// Aggregated run status, mirroring the success/partial/failed distinction
/// the caller checks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunStatus {
    Completed,
    TimedOut,
    Failed,
}

impl RunStatus {
    /// Numeric code for callers that dispatch on an integer status:
    /// 0 done, 33 paused/partial, -1 failed.
    pub fn return_code(&self) -> i32 {
        match self {
            Self::Completed => 0,
            Self::TimedOut => 33,
            Self::Failed => -1,
        }
    }
}

/// Output of a whole run: the shared time grid plus one result per
/// trajectory, tagged with the aggregated status.
#[derive(Clone, Debug)]
pub struct EnsembleResult {
    pub time_points: Vec<f64>,
    pub n_species: usize,
    pub trajectories: Vec<TrajectoryResult>,
    pub status: RunStatus,
}

fn time_grid(end_time: f64, increment: f64) -> Vec<f64> {
    let steps = (end_time / increment).round() as usize;
    (0..=steps).map(|k| k as f64 * increment).collect()
}

/// Writes population rows onto the fixed output grid. Populations are
/// piecewise constant between committed steps, so a grid point strictly
/// inside an advance records the pre-advance state and a point landing on
/// the advance end records the post-advance state.
struct GridRecorder<'a> {
    times: &'a [f64],
    buffer: Vec<i32>,
    next_idx: usize,
    n_species: usize,
}

impl<'a> GridRecorder<'a> {
    fn new(times: &'a [f64], n_species: usize) -> Self {
        Self {
            times,
            buffer: vec![0; times.len() * n_species],
            next_idx: 0,
            n_species,
        }
    }

    fn write(&mut self, state: &[i32]) {
        let start = self.next_idx * self.n_species;
        self.buffer[start..start + self.n_species].copy_from_slice(state);
        self.next_idx += 1;
    }

    /// Record every pending grid point crossed by an advance to `now`.
    fn advance(&mut self, before: &[i32], after: &[i32], now: f64) {
        while let Some(&tp) = self.times.get(self.next_idx) {
            if tp > now + TIME_EPSILON {
                break;
            }
            if tp < now - TIME_EPSILON {
                self.write(before);
            } else {
                self.write(after);
            }
        }
    }

    /// Fill every remaining grid point with the final state.
    fn pad(&mut self, state: &[i32]) {
        while self.next_idx < self.times.len() {
            self.write(state);
        }
    }

    fn pending_time(&self) -> Option<f64> {
        self.times.get(self.next_idx).copied()
    }

    fn recorded(&self) -> usize {
        self.next_idx
    }
}

/// Read-only context shared by every step of one trajectory.
struct TrajectoryContext<'a> {
    model: &'a Model,
    params: &'a ParamTable,
    rate_constants: &'a [f64],
    config: &'a RunConfig,
    times: &'a [f64],
    deadline: Option<Instant>,
    trajectory: usize,
}

/// Per-step scratch owned by one trajectory, reused across iterations.
struct StepScratch {
    propensities: Vec<f64>,
    critical: Vec<bool>,
    mean_change: Vec<f64>,
    var_change: Vec<f64>,
    tentative: Vec<i64>,
}

impl StepScratch {
    fn new(n_species: usize, n_reactions: usize) -> Self {
        Self {
            propensities: vec![0.0; n_reactions],
            critical: vec![false; n_reactions],
            mean_change: vec![0.0; n_species],
            var_change: vec![0.0; n_species],
            tentative: vec![0; n_species],
        }
    }
}

/// One pass over all reactions: O(reactions x inputs-per-reaction). Any
/// negative or non-finite propensity is a model fault.
fn evaluate_propensities(
    ctx: &TrajectoryContext<'_>,
    state: &[i32],
    time: f64,
    propensities: &mut [f64],
) -> Result<f64, SimError> {
    let mut total = 0.0;
    for (idx, reaction) in ctx.model.reactions.iter().enumerate() {
        let value = reaction.propensity(ctx.rate_constants[idx], state, ctx.params);
        if !value.is_finite() || value < 0.0 {
            return Err(SimError::InvalidPropensity {
                reaction: idx,
                value,
                time,
            });
        }
        propensities[idx] = value;
        total += value;
    }
    Ok(total)
}

/// Flag reactions that could exhaust a consumed species within the critical
/// firing threshold. Returns the critical propensity sum.
fn classify_critical(
    model: &Model,
    propensities: &[f64],
    state: &[i32],
    threshold: i32,
    critical: &mut [bool],
) -> f64 {
    let mut critical_sum = 0.0;
    for idx in 0..model.n_reactions {
        critical[idx] = false;
        if propensities[idx] <= 0.0 {
            continue;
        }
        let mut max_firings = i32::MAX;
        for delta in &model.reaction_deltas[idx] {
            if delta.delta < 0 {
                max_firings = max_firings.min(state[delta.species] / -delta.delta);
            }
        }
        if max_firings != i32::MAX && max_firings < threshold {
            critical[idx] = true;
            critical_sum += propensities[idx];
        }
    }
    critical_sum
}

/// Candidate leap from the non-critical reactions: the largest tau over
/// which no species is expected to move (in mean or variance) by more than
/// `max(epsilon * population, 1)`.
fn noncritical_tau(
    model: &Model,
    propensities: &[f64],
    critical: &[bool],
    state: &[i32],
    epsilon: f64,
    mean_change: &mut [f64],
    var_change: &mut [f64],
) -> f64 {
    mean_change.fill(0.0);
    var_change.fill(0.0);
    for (idx, deltas) in model.reaction_deltas.iter().enumerate() {
        if critical[idx] || propensities[idx] <= 0.0 {
            continue;
        }
        for delta in deltas {
            let d = delta.delta as f64;
            mean_change[delta.species] += d * propensities[idx];
            var_change[delta.species] += d * d * propensities[idx];
        }
    }
    let mut tau = f64::INFINITY;
    for species in 0..model.n_species {
        let bound = (epsilon * state[species] as f64).max(1.0);
        let mean = mean_change[species];
        let var = var_change[species];
        if mean != 0.0 {
            tau = tau.min(bound / mean.abs());
        }
        if var > 0.0 {
            tau = tau.min(bound * bound / var);
        }
    }
    tau
}

/// Propensity-weighted reaction choice by cumulative scan over the candidate
/// set (all reactions, or only criticals).
fn weighted_choice<F>(propensities: &[f64], total: f64, target: f64, select: F) -> usize
where
    F: Fn(usize) -> bool,
{
    let mut remaining = target.min(total);
    let mut chosen = None;
    for (idx, &value) in propensities.iter().enumerate() {
        if !select(idx) || value <= 0.0 {
            continue;
        }
        chosen = Some(idx);
        if remaining <= value {
            break;
        }
        remaining -= value;
    }
    // A positive total guarantees at least one candidate carried weight.
    chosen.unwrap_or(0)
}

fn poisson_draw(rng: &mut ChaCha8Rng, mean: f64) -> u64 {
    if mean <= 0.0 {
        return 0;
    }
    match Poisson::new(mean) {
        Ok(dist) => dist.sample(rng) as u64,
        Err(_) => 0,
    }
}

fn exponential_draw(rng: &mut ChaCha8Rng, rate: f64) -> f64 {
    let u: f64 = rng.r#gen();
    -u.ln() / rate
}

enum StepOutcome {
    Advanced,
    Fault(SimError),
}

/// One exact single-reaction step: exponential time advance, then one
/// propensity-weighted firing. Used when the candidate leap degenerates and
/// when retries exhaust the leap budget.
fn exact_step(
    ctx: &TrajectoryContext<'_>,
    state: &mut [i32],
    time: &mut f64,
    propensities: &[f64],
    total: f64,
    rng: &mut ChaCha8Rng,
    recorder: &mut GridRecorder<'_>,
) -> StepOutcome {
    let dt = exponential_draw(rng, total);
    let event_time = *time + dt;
    if event_time >= ctx.config.end_time - TIME_EPSILON {
        // Next event falls beyond the horizon: the state holds to the end.
        recorder.advance(state, state, ctx.config.end_time);
        *time = ctx.config.end_time;
        return StepOutcome::Advanced;
    }

    let target: f64 = rng.r#gen::<f64>() * total;
    let mut chosen = weighted_choice(propensities, total, target, |_| true);
    if !firing_keeps_non_negative(ctx.model, chosen, state) {
        // A well-formed propensity is zero once its reactants are exhausted,
        // so landing here means an expression-style law overstated its rate.
        // Re-draw among the reactions that can actually fire.
        let mut valid_total = 0.0;
        for (idx, &value) in propensities.iter().enumerate() {
            if value > 0.0 && firing_keeps_non_negative(ctx.model, idx, state) {
                valid_total += value;
            }
        }
        if valid_total <= 0.0 {
            return StepOutcome::Fault(SimError::Degenerate { time: *time });
        }
        let target: f64 = rng.r#gen::<f64>() * valid_total;
        chosen = weighted_choice(propensities, valid_total, target, |idx| {
            firing_keeps_non_negative(ctx.model, idx, state)
        });
    }

    let before = state.to_vec();
    for delta in &ctx.model.reaction_deltas[chosen] {
        state[delta.species] += delta.delta;
    }
    recorder.advance(&before, state, event_time);
    *time = event_time;
    StepOutcome::Advanced
}

fn firing_keeps_non_negative(model: &Model, reaction: usize, state: &[i32]) -> bool {
    model.reaction_deltas[reaction]
        .iter()
        .all(|delta| state[delta.species] + delta.delta >= 0)
}

/// Simulate one trajectory from `start_time`/`initial_state` to the horizon:
/// evaluate propensities, select tau, sample firings, update with rollback,
/// record, until the horizon or a terminal condition.
fn simulate_trajectory(
    ctx: &TrajectoryContext<'_>,
    initial_state: &[i32],
    start_time: f64,
    rng: &mut ChaCha8Rng,
) -> TrajectoryResult {
    let n_species = ctx.model.n_species;
    let mut recorder = GridRecorder::new(ctx.times, n_species);
    let mut scratch = StepScratch::new(n_species, ctx.model.n_reactions);
    let mut state = initial_state.to_vec();
    let mut time = start_time.clamp(0.0, ctx.config.end_time);
    let mut steps: u64 = 0;

    // Grid points at or before the start (t = 0, or a resume tail) take the
    // starting population.
    recorder.advance(&state, &state, time);

    let outcome = loop {
        if time >= ctx.config.end_time - TIME_EPSILON {
            recorder.pad(&state);
            time = ctx.config.end_time;
            break (TrajectoryStatus::Completed, None);
        }
        if let Some(deadline) = ctx.deadline {
            if Instant::now() >= deadline {
                break (TrajectoryStatus::TimedOut, None);
            }
        }

        let total = match evaluate_propensities(ctx, &state, time, &mut scratch.propensities) {
            Ok(total) => total,
            Err(fault) => break (TrajectoryStatus::Failed, Some(fault)),
        };
        if total <= 0.0 {
            // Absorbing state: nothing can fire again, pad to the horizon.
            recorder.pad(&state);
            time = ctx.config.end_time;
            break (TrajectoryStatus::Completed, None);
        }

        let critical_sum = classify_critical(
            ctx.model,
            &scratch.propensities,
            &state,
            ctx.config.critical_threshold,
            &mut scratch.critical,
        );
        let candidate = noncritical_tau(
            ctx.model,
            &scratch.propensities,
            &scratch.critical,
            &state,
            ctx.config.epsilon,
            &mut scratch.mean_change,
            &mut scratch.var_change,
        );

        if candidate < ctx.config.ssa_fallback_multiple / total {
            match exact_step(
                ctx,
                &mut state,
                &mut time,
                &scratch.propensities,
                total,
                rng,
                &mut recorder,
            ) {
                StepOutcome::Advanced => {
                    steps += 1;
                    continue;
                }
                StepOutcome::Fault(fault) => break (TrajectoryStatus::Failed, Some(fault)),
            }
        }

        // Leap mode. Clamp so the leap lands on (never crosses) the horizon
        // and the next pending output point.
        let mut tau = candidate.min(ctx.config.end_time - time);
        if let Some(pending) = recorder.pending_time() {
            if pending > time + TIME_EPSILON {
                tau = tau.min(pending - time);
            }
        }

        // At most one critical reaction may fire per leap: race the leap
        // against an exponential draw over the critical propensity sum.
        let mut critical_time = f64::INFINITY;
        let mut critical_choice = None;
        if critical_sum > 0.0 {
            let tau_c = exponential_draw(rng, critical_sum);
            if tau_c <= tau {
                tau = tau_c;
                critical_time = tau_c;
                let target: f64 = rng.r#gen::<f64>() * critical_sum;
                critical_choice = Some(weighted_choice(
                    &scratch.propensities,
                    critical_sum,
                    target,
                    |idx| scratch.critical[idx],
                ));
            }
        }

        // Sample firings and tentatively apply; on a negative population
        // discard, halve tau and retry before forcing an exact step.
        let mut committed = false;
        for _attempt in 0..=ctx.config.max_leap_retries {
            for (species, &population) in state.iter().enumerate() {
                scratch.tentative[species] = population as i64;
            }
            for (idx, deltas) in ctx.model.reaction_deltas.iter().enumerate() {
                if scratch.critical[idx] || scratch.propensities[idx] <= 0.0 {
                    continue;
                }
                let firings = poisson_draw(rng, scratch.propensities[idx] * tau);
                if firings == 0 {
                    continue;
                }
                for delta in deltas {
                    scratch.tentative[delta.species] += delta.delta as i64 * firings as i64;
                }
            }
            if let Some(chosen) = critical_choice {
                // The critical firing sits at the end of the full leap; a
                // halved leap no longer reaches it.
                if tau >= critical_time - TIME_EPSILON {
                    for delta in &ctx.model.reaction_deltas[chosen] {
                        scratch.tentative[delta.species] += i64::from(delta.delta);
                    }
                }
            }

            let valid = scratch
                .tentative
                .iter()
                .all(|&count| count >= 0 && count <= i64::from(i32::MAX));
            if valid {
                let new_time = time + tau;
                let before = state.clone();
                for (species, &count) in scratch.tentative.iter().enumerate() {
                    state[species] = count as i32;
                }
                recorder.advance(&before, &state, new_time);
                time = new_time;
                committed = true;
                break;
            }
            tau /= 2.0;
        }

        if !committed {
            warn!(
                trajectory = ctx.trajectory,
                time, "leap retries exhausted, taking exact step"
            );
            match exact_step(
                ctx,
                &mut state,
                &mut time,
                &scratch.propensities,
                total,
                rng,
                &mut recorder,
            ) {
                StepOutcome::Advanced => {}
                StepOutcome::Fault(fault) => break (TrajectoryStatus::Failed, Some(fault)),
            }
        }
        steps += 1;
    };

    let (status, fault) = outcome;
    debug!(
        trajectory = ctx.trajectory,
        steps,
        final_time = time,
        ?status,
        "trajectory finished"
    );
    TrajectoryResult {
        recorded: recorder.recorded(),
        states: recorder.buffer,
        final_time: time,
        status,
        fault,
        n_species,
    }
}

/// Derive one trajectory's RNG seed from the run seed via SplitMix64, so
/// parallel trajectories stay reproducible without sharing a generator.
fn derive_seed(base: u64, trajectory: u64) -> u64 {
    const GOLDEN_GAMMA: u64 = 0x9E3779B97F4A7C15;
    let mut z = base ^ (trajectory.wrapping_mul(GOLDEN_GAMMA));
    z = z.wrapping_add(GOLDEN_GAMMA);
    let mut result = z;
    result = (result ^ (result >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    result = (result ^ (result >> 27)).wrapping_mul(0x94D049BB133111EB);
    result ^ (result >> 31)
}

fn validate_run(model: &Model, initial_state: &[i32], config: &RunConfig) -> Result<(), SimError> {
    if initial_state.len() != model.n_species {
        return Err(SimError::Shape(format!(
            "initial state length {} does not match number of species {}",
            initial_state.len(),
            model.n_species
        )));
    }
    if let Some(&population) = initial_state.iter().find(|&&x| x < 0) {
        return Err(SimError::InvalidArgument(format!(
            "initial populations must be non-negative (found {})",
            population
        )));
    }
    if config.trajectories == 0 {
        return Err(SimError::InvalidArgument(
            "number of trajectories must be greater than zero".into(),
        ));
    }
    if !(config.end_time > 0.0) {
        return Err(SimError::InvalidArgument(
            "end_time must be positive".into(),
        ));
    }
    if !(config.increment > 0.0) || config.increment > config.end_time + TIME_EPSILON {
        return Err(SimError::InvalidArgument(format!(
            "increment {} must be positive and no larger than end_time {}",
            config.increment, config.end_time
        )));
    }
    if !(config.epsilon > 0.0 && config.epsilon < 1.0) {
        return Err(SimError::InvalidArgument(format!(
            "epsilon {} must lie strictly between 0 and 1",
            config.epsilon
        )));
    }
    if config.critical_threshold < 1 {
        return Err(SimError::InvalidArgument(
            "critical_threshold must be at least 1".into(),
        ));
    }
    if let Some(continuations) = &config.continuations {
        if continuations.len() != config.trajectories {
            return Err(SimError::Shape(format!(
                "continuations length {} does not match number of trajectories {}",
                continuations.len(),
                config.trajectories
            )));
        }
        for (idx, continuation) in continuations.iter().enumerate() {
            if continuation.state.len() != model.n_species {
                return Err(SimError::Shape(format!(
                    "continuation {} state length {} does not match number of species {}",
                    idx,
                    continuation.state.len(),
                    model.n_species
                )));
            }
            if continuation.state.iter().any(|&x| x < 0) {
                return Err(SimError::InvalidArgument(format!(
                    "continuation {} contains a negative population",
                    idx
                )));
            }
            if continuation.time.is_nan()
                || continuation.time < -TIME_EPSILON
                || continuation.time > config.end_time + TIME_EPSILON
            {
                return Err(SimError::InvalidArgument(format!(
                    "continuation {} time {} must lie between 0 and end_time",
                    idx, continuation.time
                )));
            }
        }
    }
    Ok(())
}

/// Run an ensemble of independent trajectories and collect their sampled
/// time series. Validation and parameter resolution happen up front; after
/// that nothing mutable is shared between trajectory workers.
pub fn run_ensemble(
    model: &Model,
    initial_state: &[i32],
    config: &RunConfig,
) -> Result<EnsembleResult, SimError> {
    validate_run(model, initial_state, config)?;
    let params = ParamTable::resolve(model, &config.overrides)?;
    let mut rate_constants = Vec::with_capacity(model.n_reactions);
    for (idx, reaction) in model.reactions.iter().enumerate() {
        let value = match &reaction.rate {
            RateConstant::Literal(value) => *value,
            RateConstant::Parameter(name) => params.lookup(name).ok_or_else(|| {
                SimError::InvalidArgument(format!(
                    "reaction {} rate refers to unknown parameter '{}'",
                    idx, name
                ))
            })?,
        };
        rate_constants.push(value);
    }

    let times = time_grid(config.end_time, config.increment);
    let deadline = config.timeout.map(|budget| Instant::now() + budget);
    let base_seed = config.seed.unwrap_or_else(rand::random);
    info!(
        trajectories = config.trajectories,
        end_time = config.end_time,
        samples = times.len(),
        "starting ensemble"
    );

    let simulate = || -> Vec<TrajectoryResult> {
        (0..config.trajectories)
            .into_par_iter()
            .map(|trajectory| {
                let ctx = TrajectoryContext {
                    model,
                    params: &params,
                    rate_constants: &rate_constants,
                    config,
                    times: &times,
                    deadline,
                    trajectory,
                };
                let mut rng = ChaCha8Rng::seed_from_u64(derive_seed(base_seed, trajectory as u64));
                let (start_state, start_time) = match &config.continuations {
                    Some(continuations) => {
                        let tail = &continuations[trajectory];
                        (tail.state.as_slice(), tail.time.max(0.0))
                    }
                    None => (initial_state, 0.0),
                };
                simulate_trajectory(&ctx, start_state, start_time, &mut rng)
            })
            .collect()
    };

    let trajectories = match config.threads {
        Some(n) => ThreadPoolBuilder::new()
            .num_threads(n)
            .build()
            .map_err(|e| SimError::ThreadPool(e.to_string()))?
            .install(simulate),
        None => simulate(),
    };

    let status = if trajectories
        .iter()
        .any(|t| t.status == TrajectoryStatus::Failed)
    {
        RunStatus::Failed
    } else if trajectories
        .iter()
        .any(|t| t.status == TrajectoryStatus::TimedOut)
    {
        RunStatus::TimedOut
    } else {
        RunStatus::Completed
    };
    info!(code = status.return_code(), "ensemble finished");

    Ok(EnsembleResult {
        time_points: times,
        n_species: model.n_species,
        trajectories,
        status,
    })
}

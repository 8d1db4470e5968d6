/*!
# trajsmooth

**trajsmooth** converts a sparse set of waypoints into a densely sampled, smooth path that a
motion controller can step through at a fixed time step - given the waypoints, the total time
allowed and the controller period, the library up-samples the path in up to three passes and
smooths it after each one, never producing more points than the controller has samples for.

## Features
* waypoints of any dimension (x/y, x/y/heading, arm angles, ...)
* sample budget search for the number of points to inject in each pass
* linear injection and gradient smoothing usable on their own
* tunable smoothing weights and tolerance, with a bound on smoothing sweeps

## Using **trajsmooth**
Simply add the following to your `Cargo.toml` file:

```ignore
[dependencies]
trajsmooth = "*"
```

and now you can smooth paths:

```
use trajsmooth::{smooth_path, InjectionPlan, Path, PlannerError};

fn main() -> Result<(), PlannerError> {
    // waypoints for the path
    let waypoints = Path::from_rows(&[[1., 2.], [2., 7.], [4., 7.], [6., 9.], [10., 11.]])?;

    // 15 seconds to complete the path with a 100ms control loop
    let path = smooth_path(&waypoints, 15., 0.1)?;

    // the point count was chosen to fit within the 150 available samples
    let plan = InjectionPlan::solve(waypoints.len(), 15., 0.1)?;
    assert_eq!(plan.output_len(waypoints.len()), path.len());
    assert!(path.len() <= 150);

    // hand each point to the controller, one per time step
    for point in path.iter() {
        println!("{}", point);
    }
    Ok(())
}
```

 */

use log::{debug, info, trace, warn};
use std::fmt;
use std::ops::Index;

use nalgebra::DVector;
use std::fmt::Formatter;

/// Sample budgets below this use the two pass search
const SMALL_BUDGET_LIMIT: f64 = 100.;

/// Result type used throughout the crate
pub type Result<T> = std::result::Result<T, PlannerError>;

/// Errors returned while planning a path
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PlannerError {
    /// A path needs a start and an end.
    #[error("path must have at least 2 points, got {count}")]
    InsufficientPoints { count: usize },

    /// A point with no coordinates.
    #[error("point at index {index} has no coordinates")]
    EmptyPoint { index: usize },

    /// A point whose dimension differs from the first point of its path.
    #[error("point at index {index} has dimension {actual}, expected {expected}")]
    DimensionMismatch {
        index: usize,
        expected: usize,
        actual: usize,
    },

    #[error("point at index {index} has a non-finite coordinate at dimension {dimension}")]
    NonFiniteCoordinate { index: usize, dimension: usize },

    /// Total time and time step must be positive and finite.
    #[error("{name} must be positive and finite, got {value}")]
    InvalidTime { name: &'static str, value: f64 },

    /// The smoothing reference is not index aligned with the path being smoothed.
    #[error("reference path has {reference} points but the path has {actual}")]
    LengthMismatch { reference: usize, actual: usize },

    #[error("invalid smoothing parameter {name}: {message}")]
    InvalidParameter { name: &'static str, message: String },

    /// The smoother was still moving points after the allowed number of sweeps.
    #[error("smoothing did not converge after {sweeps} sweeps (last change {change})")]
    ConvergenceFailure { sweeps: usize, change: f64 },
}

impl PlannerError {
    /// Returns true for errors caused by bad input rather than by the smoother
    ///
    /// # Examples
    ///
    /// ```
    /// use trajsmooth::Path;
    /// let err = Path::from_rows(&[[1., 2.]]).unwrap_err();
    /// assert!(err.is_invalid_input());
    /// ```
    pub fn is_invalid_input(&self) -> bool {
        !matches!(self, PlannerError::ConvergenceFailure { .. })
    }
}

/// a point in n-dimensional space
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    coords: DVector<f64>,
}

impl Point {
    /// Creates a point from its coordinates
    ///
    /// # Arguments
    ///
    /// `coords` - value along each dimension
    ///
    /// # Examples
    /// ```
    /// use trajsmooth::Point;
    /// let p = Point::new(&[5.2, -6.75, 90.]);
    /// assert_eq!(3, p.dim());
    /// ```
    pub fn new(coords: &[f64]) -> Point {
        Point {
            coords: DVector::from_column_slice(coords),
        }
    }

    /// Number of coordinates in the point
    pub fn dim(&self) -> usize {
        self.coords.len()
    }

    pub fn as_slice(&self) -> &[f64] {
        self.coords.as_slice()
    }
}

impl From<Vec<f64>> for Point {
    fn from(coords: Vec<f64>) -> Point {
        Point {
            coords: DVector::from_vec(coords),
        }
    }
}

impl Index<usize> for Point {
    type Output = f64;

    fn index(&self, dimension: usize) -> &f64 {
        &self.coords[dimension]
    }
}

impl fmt::Display for Point {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let coords: Vec<String> = self.coords.iter().map(|c| c.to_string()).collect();
        write!(f, "Point({})", coords.join(", "))
    }
}

/// An ordered sequence of at least 2 points that all share the same dimension
#[derive(Debug, Clone, PartialEq)]
pub struct Path {
    points: Vec<Point>,
}

impl Path {
    /// Returns a validated path
    ///
    /// # Arguments
    ///
    /// `points` - the points of the path, in order
    ///
    /// # Examples
    ///
    /// ```
    /// use trajsmooth::{Path, Point};
    /// let path = Path::new(vec![Point::new(&[1., 2.]), Point::new(&[2., 7.])]).unwrap();
    /// assert_eq!(2, path.len());
    /// assert_eq!(2, path.dim());
    /// ```
    pub fn new(points: Vec<Point>) -> Result<Path> {
        if points.len() < 2 {
            return Err(PlannerError::InsufficientPoints {
                count: points.len(),
            });
        }

        let expected = points[0].dim();
        if expected == 0 {
            return Err(PlannerError::EmptyPoint { index: 0 });
        }

        for (index, point) in points.iter().enumerate() {
            if point.dim() != expected {
                return Err(PlannerError::DimensionMismatch {
                    index,
                    expected,
                    actual: point.dim(),
                });
            }
            if let Some(dimension) = point.coords.iter().position(|c| !c.is_finite()) {
                return Err(PlannerError::NonFiniteCoordinate { index, dimension });
            }
        }

        Ok(Path { points })
    }

    /// Convenience constructor taking one row of coordinates per point
    ///
    /// # Examples
    ///
    /// ```
    /// use trajsmooth::Path;
    /// let path = Path::from_rows(&[[1., 1., 0.], [5., 1., 45.], [9., 12., 90.]]).unwrap();
    /// assert_eq!(3, path.len());
    /// ```
    pub fn from_rows<R: AsRef<[f64]>>(rows: &[R]) -> Result<Path> {
        Path::new(rows.iter().map(|row| Point::new(row.as_ref())).collect())
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Always false, a path holds at least 2 points
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Dimension shared by every point in the path
    pub fn dim(&self) -> usize {
        self.points[0].dim()
    }

    pub fn first(&self) -> &Point {
        &self.points[0]
    }

    pub fn last(&self) -> &Point {
        &self.points[self.points.len() - 1]
    }

    pub fn points(&self) -> &[Point] {
        &self.points
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Point> {
        self.points.iter()
    }

    pub fn into_points(self) -> Vec<Point> {
        self.points
    }
}

impl Index<usize> for Path {
    type Output = Point;

    fn index(&self, index: usize) -> &Point {
        &self.points[index]
    }
}

impl<'a> IntoIterator for &'a Path {
    type Item = &'a Point;
    type IntoIter = std::slice::Iter<'a, Point>;

    fn into_iter(self) -> Self::IntoIter {
        self.points.iter()
    }
}

impl IntoIterator for Path {
    type Item = Point;
    type IntoIter = std::vec::IntoIter<Point>;

    fn into_iter(self) -> Self::IntoIter {
        self.points.into_iter()
    }
}

/// Prints one point per line with tab separated coordinates
impl fmt::Display for Path {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for point in &self.points {
            let coords: Vec<String> = point.coords.iter().map(|c| c.to_string()).collect();
            writeln!(f, "{}", coords.join("\t"))?;
        }
        Ok(())
    }
}

/// returns the number of points after injecting `num_to_inject` points into every gap
fn injected_len(path_len: usize, num_to_inject: usize) -> usize {
    path_len.saturating_add(num_to_inject.saturating_mul(path_len.saturating_sub(1)))
}

/// Number of points to inject between consecutive points in each of the three passes
///
/// A factor of 0 leaves the path length unchanged for that pass.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct InjectionPlan {
    pub first: usize,
    pub second: usize,
    pub third: usize,
}

impl InjectionPlan {
    /// Returns the injection factors that keep the final path within the sample budget
    ///
    /// The budget is `max_time / time_step`. Budgets under 100 samples search two passes with a
    /// first factor in `4..6` and a second in `1..8`, keeping the largest point count that fits.
    /// Larger budgets search three passes over `1..6`, `1..7` and `1..8`, keeping the last
    /// combination that fits in iteration order. When nothing fits the identity plan is returned.
    ///
    /// # Arguments
    ///
    /// `path_length` - number of waypoints
    /// `max_time` - time allowed to complete the path
    /// `time_step` - period of the control loop
    ///
    /// # Examples
    ///
    /// ```
    /// use trajsmooth::InjectionPlan;
    /// // 15 seconds at 100ms gives a budget of 150 samples
    /// let plan = InjectionPlan::solve(5, 15., 0.1).unwrap();
    /// assert_eq!([5, 2, 1], plan.factors());
    /// assert_eq!(145, plan.output_len(5));
    /// ```
    pub fn solve(path_length: usize, max_time: f64, time_step: f64) -> Result<InjectionPlan> {
        if path_length < 2 {
            return Err(PlannerError::InsufficientPoints { count: path_length });
        }
        check_time("max_time", max_time)?;
        check_time("time_step", time_step)?;

        let sample_budget = max_time / time_step;
        let mut plan = InjectionPlan::default();

        if sample_budget < SMALL_BUDGET_LIMIT {
            let mut best_total = 0;
            for first in 4..6 {
                for second in 1..8 {
                    let points_first = injected_len(path_length, first);
                    let points_total = injected_len(points_first, second);

                    if points_total > best_total && points_total as f64 <= sample_budget {
                        plan = InjectionPlan { first, second, third: 0 };
                        best_total = points_total;
                    }
                }
            }
        } else {
            for first in 1..6 {
                for second in 1..7 {
                    for third in 1..8 {
                        let points_first = injected_len(path_length, first);
                        let points_second = injected_len(points_first, second);
                        let points_total = injected_len(points_second, third);

                        // the last fit wins, not the largest
                        if points_total as f64 <= sample_budget {
                            plan = InjectionPlan { first, second, third };
                        }
                    }
                }
            }
        }

        debug!("Sample budget {} for {} waypoints gives plan {}", sample_budget, path_length, plan);
        Ok(plan)
    }

    /// The factors in the order they are applied
    pub fn factors(&self) -> [usize; 3] {
        [self.first, self.second, self.third]
    }

    pub fn is_identity(&self) -> bool {
        self.factors().iter().all(|&factor| factor == 0)
    }

    /// Number of points a path of `path_len` points has after all three passes
    pub fn output_len(&self, path_len: usize) -> usize {
        self.factors()
            .iter()
            .fold(path_len, |len, &factor| injected_len(len, factor))
    }
}

impl fmt::Display for InjectionPlan {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "InjectionPlan({}, {}, {})", self.first, self.second, self.third)
    }
}

fn check_time(name: &'static str, value: f64) -> Result<()> {
    if value.is_finite() && value > 0. {
        Ok(())
    } else {
        Err(PlannerError::InvalidTime { name, value })
    }
}

/// Up-samples a path by linear injection
///
/// Between every pair of consecutive points `num_to_inject` evenly spaced points are inserted.
/// Every original point is kept as is, including the last one.
///
/// # Arguments
///
/// `path` - the path to up-sample
/// `num_to_inject` - number of points to add to each gap
///
/// # Examples
///
/// ```
/// use trajsmooth::{inject, Path};
/// let path = Path::from_rows(&[[0., 0.], [3., 6.]]).unwrap();
/// let more = inject(&path, 2);
/// assert_eq!(4, more.len());
/// assert_eq!(&[1., 2.], more[1].as_slice());
/// ```
pub fn inject(path: &Path, num_to_inject: usize) -> Path {
    let mut more_points = Vec::with_capacity(injected_len(path.len(), num_to_inject));
    let divisor = (num_to_inject + 1) as f64;

    for pair in path.points.windows(2) {
        let (start, end) = (&pair[0], &pair[1]);
        more_points.push(start.clone());

        let step = (&end.coords - &start.coords) / divisor;
        for m in 1..=num_to_inject {
            more_points.push(Point {
                coords: &step * m as f64 + &start.coords,
            });
        }
    }

    // copied rather than interpolated so the end point is exact
    more_points.push(path.last().clone());

    Path { points: more_points }
}

/// How the smoother treats the first point of a path
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub enum StartBoundary {
    /// The first point is never moved
    #[default]
    Pinned,
    /// The first point is smoothed with the last point of the path as its predecessor
    Wrapped,
}

/// Weights and stopping criteria for the smoother
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct SmoothingConfig {
    /// Pull towards the reference path (alpha)
    pub weight_data: f64,
    /// Pull towards the midpoint of the neighbours (beta)
    pub weight_smooth: f64,
    /// Sweeps stop once the summed movement in a sweep drops below this
    pub tolerance: f64,
    pub max_sweeps: usize,
    pub start_boundary: StartBoundary,
}

impl Default for SmoothingConfig {
    fn default() -> SmoothingConfig {
        SmoothingConfig {
            weight_data: 0.7,
            weight_smooth: 0.3,
            tolerance: 0.0000001,
            max_sweeps: 100_000,
            start_boundary: StartBoundary::Pinned,
        }
    }
}

impl SmoothingConfig {
    /// Returns a config with the given weights and tolerance and default sweep limit
    ///
    /// # Examples
    ///
    /// ```
    /// use trajsmooth::{SmoothingConfig, StartBoundary};
    /// let config = SmoothingConfig::new(0.5, 0.2, 1e-6)
    ///     .with_max_sweeps(500)
    ///     .with_start_boundary(StartBoundary::Wrapped);
    /// assert!(config.validate().is_ok());
    /// ```
    pub fn new(weight_data: f64, weight_smooth: f64, tolerance: f64) -> SmoothingConfig {
        SmoothingConfig {
            weight_data,
            weight_smooth,
            tolerance,
            ..SmoothingConfig::default()
        }
    }

    pub fn with_max_sweeps(mut self, max_sweeps: usize) -> SmoothingConfig {
        self.max_sweeps = max_sweeps;
        self
    }

    pub fn with_start_boundary(mut self, start_boundary: StartBoundary) -> SmoothingConfig {
        self.start_boundary = start_boundary;
        self
    }

    /// Checks that the weights and tolerance are positive and finite and that at least one
    /// sweep is allowed
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("weight_data", self.weight_data),
            ("weight_smooth", self.weight_smooth),
            ("tolerance", self.tolerance),
        ];
        for (name, value) in positive {
            if !value.is_finite() || value <= 0. {
                return Err(PlannerError::InvalidParameter {
                    name,
                    message: format!("must be positive and finite, got {}", value),
                });
            }
        }

        if self.max_sweeps == 0 {
            return Err(PlannerError::InvalidParameter {
                name: "max_sweeps",
                message: String::from("must allow at least one sweep"),
            });
        }

        Ok(())
    }
}

/// Runs one smoothing sweep over `working` in place and returns the total movement
fn sweep(reference: &[Point], working: &mut [Point], config: &SmoothingConfig) -> f64 {
    let n = working.len();
    let start = match config.start_boundary {
        StartBoundary::Pinned => 1,
        StartBoundary::Wrapped => 0,
    };

    let mut change = 0.;
    // the last point is never updated
    for i in start..n - 1 {
        let prev = if i == 0 { n - 1 } else { i - 1 };
        for d in 0..working[i].dim() {
            let aux = working[i].coords[d];
            let neighbours = working[prev].coords[d] + working[i + 1].coords[d];
            let updated = aux
                + (config.weight_data * (reference[i].coords[d] - aux)
                    + config.weight_smooth * (neighbours - 2. * aux));
            working[i].coords[d] = updated;
            change += (aux - updated).abs();
        }
    }

    change
}

/// Smooths a path by gradient descent
///
/// Each point is repeatedly pulled towards its counterpart in `reference` and towards the
/// midpoint of its neighbours until a full sweep moves the points by less than the tolerance.
/// The last point is never moved.
///
/// # Arguments
///
/// `reference` - path the result should stay close to, index aligned with `path`
/// `path` - starting point for the optimization
/// `config` - weights and stopping criteria
///
/// # Examples
///
/// ```
/// use trajsmooth::{inject, smooth, Path, SmoothingConfig};
/// let path = inject(&Path::from_rows(&[[0., 0.], [1., 4.], [2., 0.]]).unwrap(), 1);
/// let smoothed = smooth(&path, &path, &SmoothingConfig::default()).unwrap();
/// assert_eq!(path.len(), smoothed.len());
/// // the corner gets rounded off
/// assert!(smoothed[2][1] < 4.);
/// ```
pub fn smooth(reference: &Path, path: &Path, config: &SmoothingConfig) -> Result<Path> {
    config.validate()?;

    if reference.len() != path.len() {
        return Err(PlannerError::LengthMismatch {
            reference: reference.len(),
            actual: path.len(),
        });
    }
    if reference.dim() != path.dim() {
        return Err(PlannerError::DimensionMismatch {
            index: 0,
            expected: reference.dim(),
            actual: path.dim(),
        });
    }

    let mut working = path.points.clone();

    let mut sweeps = 0;
    let mut change = config.tolerance;
    while change >= config.tolerance {
        if sweeps == config.max_sweeps {
            warn!("Smoothing {} points stopped after {} sweeps with change {}", working.len(), sweeps, change);
            return Err(PlannerError::ConvergenceFailure { sweeps, change });
        }
        change = sweep(&reference.points, &mut working, config);
        sweeps += 1;
    }

    trace!("Smoothed {} points in {} sweeps", working.len(), sweeps);
    Ok(Path { points: working })
}

/// Injects and smooths the waypoints with the default smoothing config
///
/// # Arguments
///
/// `waypoints` - the sparse path to follow
/// `total_time` - time allowed to complete the path
/// `time_step` - period of the control loop
///
/// # Examples
///
/// ```
/// use trajsmooth::{smooth_path, Path};
/// let waypoints = Path::from_rows(&[[1., 2.], [2., 7.], [4., 7.], [6., 9.], [10., 11.]]).unwrap();
/// let path = smooth_path(&waypoints, 15., 0.1).unwrap();
/// assert_eq!(145, path.len());
/// assert_eq!(waypoints.last(), path.last());
/// ```
pub fn smooth_path(waypoints: &Path, total_time: f64, time_step: f64) -> Result<Path> {
    smooth_path_with(waypoints, total_time, time_step, &SmoothingConfig::default())
}

/// Injects and smooths the waypoints with the given smoothing config
///
/// The number of points to inject in each pass comes from [`InjectionPlan::solve`]. Every pass
/// injects the current path and smooths the result against itself, so a factor of 0 still
/// runs the smoother.
pub fn smooth_path_with(
    waypoints: &Path,
    total_time: f64,
    time_step: f64,
    config: &SmoothingConfig,
) -> Result<Path> {
    config.validate()?;
    let plan = InjectionPlan::solve(waypoints.len(), total_time, time_step)?;

    info!("Smoothing path using {} waypoints into {} points", waypoints.len(), plan.output_len(waypoints.len()));

    let mut path = waypoints.clone();
    for (pass, factor) in plan.factors().into_iter().enumerate() {
        let injected = inject(&path, factor);
        path = smooth(&injected, &injected, config)?;
        debug!("Pass {} injected {} points per gap, path has {} points", pass + 1, factor, path.len());
    }

    info!("Finished smoothing path using {} waypoints", waypoints.len());
    Ok(path)
}

/// Path planner holding a set of waypoints and its smoothing parameters
///
/// # Examples
///
/// ```
/// use trajsmooth::{Path, PathPlanner};
/// // x, y and heading
/// let waypoints = Path::from_rows(&[[2., 2., 0.], [2., 12., 180.], [12., 22., 540.], [22., 2., 1080.]]).unwrap();
/// let mut planner = PathPlanner::new(&waypoints);
/// planner.set_path_alpha(0.7);
/// planner.set_path_beta(0.3);
/// planner.set_path_tolerance(0.0000001);
/// let path = planner.calculate(15., 0.1).unwrap();
/// assert!(path.len() <= 150);
/// ```
#[derive(Debug, Clone)]
pub struct PathPlanner {
    waypoints: Path,
    config: SmoothingConfig,
    plan: Option<InjectionPlan>,
    smooth_path: Option<Path>,
}

impl PathPlanner {
    /// Returns a planner with the default smoothing parameters, keeping its own copy of the
    /// waypoints
    pub fn new(waypoints: &Path) -> PathPlanner {
        PathPlanner {
            waypoints: waypoints.clone(),
            config: SmoothingConfig::default(),
            plan: None,
            smooth_path: None,
        }
    }

    pub fn set_path_alpha(&mut self, alpha: f64) {
        self.config.weight_data = alpha;
    }

    pub fn set_path_beta(&mut self, beta: f64) {
        self.config.weight_smooth = beta;
    }

    pub fn set_path_tolerance(&mut self, tolerance: f64) {
        self.config.tolerance = tolerance;
    }

    pub fn set_max_sweeps(&mut self, max_sweeps: usize) {
        self.config.max_sweeps = max_sweeps;
    }

    pub fn set_start_boundary(&mut self, start_boundary: StartBoundary) {
        self.config.start_boundary = start_boundary;
    }

    pub fn config(&self) -> &SmoothingConfig {
        &self.config
    }

    pub fn waypoints(&self) -> &Path {
        &self.waypoints
    }

    /// Calculates the smooth path for the given time limit and control period
    ///
    /// Any result from an earlier call is discarded, even if this one fails.
    ///
    /// # Arguments
    ///
    /// `total_time` - time allowed to complete the path
    /// `time_step` - period of the control loop
    pub fn calculate(&mut self, total_time: f64, time_step: f64) -> Result<&Path> {
        self.plan = None;
        self.smooth_path = None;

        let plan = InjectionPlan::solve(self.waypoints.len(), total_time, time_step)?;
        let path = smooth_path_with(&self.waypoints, total_time, time_step, &self.config)?;

        self.plan = Some(plan);
        Ok(self.smooth_path.insert(path))
    }

    /// The path from the last successful `calculate`
    pub fn smooth_path(&self) -> Option<&Path> {
        self.smooth_path.as_ref()
    }

    /// The injection plan from the last successful `calculate`
    pub fn plan(&self) -> Option<InjectionPlan> {
        self.plan
    }
}

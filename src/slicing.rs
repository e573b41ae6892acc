//! Translation of numpy-style index expressions into wire-level range
//! requests.
//!
//! A caller describes a cutout one axis at a time: a fixed index, a
//! range with optional start/stop/step, or an ellipsis that soaks up
//! however many full-range axes are needed.  The translator normalizes
//! that into two parallel views of the same request:
//!
//! * the **request slicing**: a plain `(start, stop)` pair per axis,
//!   with the channel axis forced to its full range (the server always
//!   sends every channel);
//! * the **result slicing**: how to carve the caller's answer back out
//!   of the dense response, including which axes to squeeze away, which
//!   channels to keep, and any step to apply client-side.
//!
//! Everything here fails before a single byte is requested.

use ndarray::{ArrayD, Axis, Slice};

use crate::codec::Element;
use crate::errors::{Error, Result};

/// One axis of a caller-supplied index expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DimSlice {
    /// A fixed index; the axis is dropped from the result.
    Index(usize),
    /// A half-open range with optional bounds and step.  `None` bounds
    /// mean "from the beginning" / "to the end of the axis".
    Range {
        start: Option<usize>,
        stop: Option<usize>,
        step: Option<usize>,
    },
    /// Wildcard fill: expands to as many full-range axes as needed.
    Ellipsis,
}

impl DimSlice {
    /// The full range of an axis, `[..]`.
    pub fn full() -> DimSlice {
        DimSlice::Range {
            start: None,
            stop: None,
            step: None,
        }
    }

    pub fn idx(index: usize) -> DimSlice {
        DimSlice::Index(index)
    }

    /// `[start..stop]`.
    pub fn span(start: usize, stop: usize) -> DimSlice {
        DimSlice::Range {
            start: Some(start),
            stop: Some(stop),
            step: None,
        }
    }

    /// `[start..stop]` with a client-side step.
    pub fn stepped(start: usize, stop: usize, step: usize) -> DimSlice {
        DimSlice::Range {
            start: Some(start),
            stop: Some(stop),
            step: Some(step),
        }
    }
}

/// One axis of the result slicing, relative to the dense response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AxisSelect {
    /// Take this single index and squeeze the axis away.
    Index(usize),
    /// Keep `start..stop`, then every `step`-th element.
    Range { start: usize, stop: usize, step: usize },
}

/// The translated form of an index expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slicing {
    /// Per-axis `(start, stop)` to request from the server.  The
    /// channel axis (index 0) always spans the full channel range.
    pub request: Vec<(usize, usize)>,
    /// Per-axis selection to apply to the dense response.
    pub result: Vec<AxisSelect>,
}

impl Slicing {
    pub fn start(&self) -> Vec<usize> {
        self.request.iter().map(|&(start, _)| start).collect()
    }

    pub fn stop(&self) -> Vec<usize> {
        self.request.iter().map(|&(_, stop)| stop).collect()
    }
}

/// Translate a caller-supplied index expression against a volume shape.
pub fn translate(args: &[DimSlice], shape: &[usize]) -> Result<Slicing> {
    let expanded = expand(args, shape.len())?;
    if expanded.is_empty() {
        // Zero-rank volume: nothing to request.
        return Ok(Slicing {
            request: Vec::new(),
            result: Vec::new(),
        });
    }
    let explicit = make_explicit(&expanded, shape)?;
    Ok(split(&explicit, shape))
}

/// A term with ellipses expanded away and nothing else changed.
/// After this stage every entry is `Index` or `Range`.
fn expand(args: &[DimSlice], rank: usize) -> Result<Vec<DimSlice>> {
    let sole_all_axes_form = args.is_empty()
        || (args.len() == 1 && matches!(args[0], DimSlice::Ellipsis))
        || (args.len() == 1 && args[0] == DimSlice::full());

    if rank == 0 {
        if sole_all_axes_form {
            return Ok(Vec::new());
        }
        return Err(Error::Slicing(
            "cannot index into a zero-extent volume".to_string(),
        ));
    }

    let ellipses = args
        .iter()
        .filter(|term| matches!(term, DimSlice::Ellipsis))
        .count();
    if ellipses > 1 {
        return Err(Error::Slicing(
            "found more than one ellipsis in the index expression".to_string(),
        ));
    }
    if args.len() > rank && !sole_all_axes_form {
        return Err(Error::Slicing(format!(
            "index expression has {} terms but the volume has only {} axes",
            args.len(),
            rank
        )));
    }

    let mut expanded: Vec<DimSlice> = Vec::with_capacity(rank);
    for term in args {
        match term {
            DimSlice::Ellipsis => {
                let fill = rank + 1 - args.len();
                expanded.extend(std::iter::repeat(DimSlice::full()).take(fill));
            }
            other => expanded.push(*other),
        }
    }
    // Trailing axes not mentioned get their full range.
    while expanded.len() < rank {
        expanded.push(DimSlice::full());
    }
    Ok(expanded)
}

/// One axis with its bounds resolved against the shape.
#[derive(Debug, Clone, Copy)]
enum ExplicitTerm {
    Index(usize),
    Range { start: usize, stop: usize, step: usize },
}

fn make_explicit(expanded: &[DimSlice], shape: &[usize]) -> Result<Vec<ExplicitTerm>> {
    expanded
        .iter()
        .zip(shape.iter())
        .map(|(term, &axis_len)| match *term {
            DimSlice::Index(i) => Ok(ExplicitTerm::Index(i)),
            DimSlice::Range { start, stop, step } => {
                let step = step.unwrap_or(1);
                if step == 0 {
                    return Err(Error::Slicing("slice step cannot be zero".to_string()));
                }
                Ok(ExplicitTerm::Range {
                    start: start.unwrap_or(0),
                    stop: stop.unwrap_or(axis_len),
                    step,
                })
            }
            DimSlice::Ellipsis => unreachable!("ellipses are expanded before this stage"),
        })
        .collect()
}

fn split(explicit: &[ExplicitTerm], shape: &[usize]) -> Slicing {
    let mut request = Vec::with_capacity(explicit.len());
    let mut result = Vec::with_capacity(explicit.len());

    for term in explicit {
        match *term {
            ExplicitTerm::Range { start, stop, step } => {
                request.push((start, stop));
                result.push(AxisSelect::Range {
                    start: 0,
                    stop: stop.saturating_sub(start),
                    step,
                });
            }
            ExplicitTerm::Index(i) => {
                request.push((i, i + 1));
                result.push(AxisSelect::Index(0));
            }
        }
    }

    // The channel axis is always requested in full; the caller's own
    // channel selection is applied to the dense response instead.
    request[0] = (0, shape[0]);
    result[0] = match explicit[0] {
        ExplicitTerm::Range { start, stop, step } => AxisSelect::Range { start, stop, step },
        ExplicitTerm::Index(i) => AxisSelect::Index(i),
    };

    Slicing { request, result }
}

/// Check a read ROI against the volume shape.
pub fn validate_read_roi(start: &[usize], stop: &[usize], shape: &[usize]) -> Result<()> {
    if start.len() != stop.len() || start.len() != shape.len() {
        return Err(Error::Slicing(format!(
            "start/stop/shape rank mismatch: {}/{}/{}",
            start.len(),
            stop.len(),
            shape.len()
        )));
    }
    for axis in 0..shape.len() {
        if start[axis] >= stop[axis] || stop[axis] > shape[axis] {
            return Err(Error::Slicing(format!(
                "read range [{}, {}) is invalid on axis {} of extent {}",
                start[axis], stop[axis], axis, shape[axis]
            )));
        }
    }
    Ok(())
}

/// Check a write ROI.  `stop` may exceed the current shape (the store
/// grows), but the channel axis must be covered in full.
pub fn validate_write_roi(start: &[usize], stop: &[usize], shape: &[usize]) -> Result<()> {
    if start.len() != stop.len() || start.len() != shape.len() {
        return Err(Error::Slicing(format!(
            "start/stop/shape rank mismatch: {}/{}/{}",
            start.len(),
            stop.len(),
            shape.len()
        )));
    }
    if start.is_empty() {
        return Ok(());
    }
    if start[0] != 0 || stop[0] != shape[0] {
        return Err(Error::Slicing(
            "partial-channel writes are not supported: writes must span all channels".to_string(),
        ));
    }
    for axis in 0..shape.len() {
        if start[axis] >= stop[axis] {
            return Err(Error::Slicing(format!(
                "write range [{}, {}) is empty on axis {}",
                start[axis], stop[axis], axis
            )));
        }
    }
    Ok(())
}

/// Reject result slicings that cannot be expressed as a dense write:
/// stepped ranges, and channel selections short of the full range.
pub fn check_writable(slicing: &Slicing, shape: &[usize]) -> Result<()> {
    for select in &slicing.result {
        if let AxisSelect::Range { step, .. } = select {
            if *step != 1 {
                return Err(Error::Slicing(
                    "stepped writes are not supported".to_string(),
                ));
            }
        }
    }
    match slicing.result[0] {
        AxisSelect::Range { start: 0, stop, step: 1 } if stop == shape[0] => Ok(()),
        _ => Err(Error::Slicing(
            "partial-channel writes are not supported: writes must span all channels".to_string(),
        )),
    }
}

/// Carve the caller's answer out of the dense response.
///
/// Range axes are trimmed and stepped; fixed-index axes are squeezed
/// away (last to first, so axis numbers stay valid while removing).
pub fn apply_result<T: Element>(dense: &ArrayD<T>, result: &[AxisSelect]) -> ArrayD<T> {
    let mut view = dense.view();
    for (axis, select) in result.iter().enumerate() {
        let bounds = match *select {
            AxisSelect::Range { start, stop, step } => {
                // numpy-style clipping: a stop past the end of the
                // response means "to the end".  Only the channel entry
                // can be affected, since the other axes are relative to
                // the response by construction.
                let len = view.len_of(Axis(axis));
                let stop = stop.min(len);
                let start = start.min(stop);
                Slice::new(start as isize, Some(stop as isize), step as isize)
            }
            AxisSelect::Index(i) => Slice::new(i as isize, Some(i as isize + 1), 1),
        };
        view.slice_axis_inplace(Axis(axis), bounds);
    }
    for axis in (0..result.len()).rev() {
        if matches!(result[axis], AxisSelect::Index(_)) {
            view = view.index_axis_move(Axis(axis), 0);
        }
    }
    view.to_owned()
}

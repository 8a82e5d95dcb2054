use std::fmt;

use serde::{Deserialize, Serialize};

use super::model::{EventRecord, RunInterval};

// ---------------------------------------------------------------------------
// Fields and terms
// ---------------------------------------------------------------------------

/// A column of an [`EventRecord`] a predicate can reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Field {
    Run,
    Channel,
    Energy,
    FitSlo,
    RiseNoise,
}

impl Field {
    pub fn value(self, ev: &EventRecord) -> f64 {
        match self {
            Field::Run => ev.run as f64,
            Field::Channel => ev.channel as f64,
            Field::Energy => ev.energy,
            Field::FitSlo => ev.fit_slo,
            Field::RiseNoise => ev.rise_noise,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Field::Run => "run",
            Field::Channel => "channel",
            Field::Energy => "trapENFCal",
            Field::FitSlo => "fitSlo",
            Field::RiseNoise => "riseNoise",
        }
    }
}

/// Operand of a comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Term {
    Field(Field),
    Const(f64),
    /// `coeffs[0] + coeffs[1]*x + coeffs[2]*x^2 + ...` with `x` the field value.
    Poly { field: Field, coeffs: Vec<f64> },
}

impl Term {
    fn eval(&self, ev: &EventRecord) -> f64 {
        match self {
            Term::Field(f) => f.value(ev),
            Term::Const(c) => *c,
            Term::Poly { field, coeffs } => {
                let x = field.value(ev);
                // Horner, highest power first
                coeffs.iter().rev().fold(0.0, |acc, c| acc * x + c)
            }
        }
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Term::Field(field) => f.write_str(field.name()),
            Term::Const(c) => write!(f, "{c:.3}"),
            Term::Poly { field, coeffs } => {
                let mut parts = Vec::with_capacity(coeffs.len());
                for (pow, c) in coeffs.iter().enumerate().rev() {
                    parts.push(match pow {
                        0 => format!("{c:.3}"),
                        1 => format!("{c:.2e}*{}", field.name()),
                        _ => format!("{c:.2e}*pow({},{pow})", field.name()),
                    });
                }
                write!(f, "({})", parts.join(" + "))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CmpOp {
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    fn apply(self, lhs: f64, rhs: f64) -> bool {
        match self {
            CmpOp::Lt => lhs < rhs,
            CmpOp::Le => lhs <= rhs,
            CmpOp::Gt => lhs > rhs,
            CmpOp::Ge => lhs >= rhs,
        }
    }

    fn symbol(self) -> &'static str {
        match self {
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
        }
    }
}

// ---------------------------------------------------------------------------
// Expr – composable event predicate
// ---------------------------------------------------------------------------

/// A boolean predicate over one [`EventRecord`].
///
/// Built from cut records and evaluated directly; `Display` only renders
/// the text form for logs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    Const(bool),
    Compare { lhs: Term, op: CmpOp, rhs: Term },
    RunRange(RunInterval),
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Not(Box<Expr>),
}

impl Expr {
    /// `trapENFCal >= energy`
    pub fn threshold(energy: f64) -> Expr {
        Expr::Compare {
            lhs: Term::Field(Field::Energy),
            op: CmpOp::Ge,
            rhs: Term::Const(energy),
        }
    }

    /// `fitSlo < cut`
    pub fn slope(cut: f64) -> Expr {
        Expr::Compare {
            lhs: Term::Field(Field::FitSlo),
            op: CmpOp::Lt,
            rhs: Term::Const(cut),
        }
    }

    /// `riseNoise < a*E^2 + b*E + c`
    pub fn rise_noise(a: f64, b: f64, c: f64) -> Expr {
        Expr::Compare {
            lhs: Term::Field(Field::RiseNoise),
            op: CmpOp::Lt,
            rhs: Term::Poly {
                field: Field::Energy,
                coeffs: vec![c, b, a],
            },
        }
    }

    /// Conjunction; an empty list is `true`, a single element is returned as is.
    pub fn all(parts: impl IntoIterator<Item = Expr>) -> Expr {
        let mut parts: Vec<Expr> = parts.into_iter().collect();
        match parts.len() {
            0 => Expr::Const(true),
            1 => parts.remove(0),
            _ => Expr::And(parts),
        }
    }

    /// Disjunction; an empty list is `false`, a single element is returned as is.
    pub fn any(parts: impl IntoIterator<Item = Expr>) -> Expr {
        let mut parts: Vec<Expr> = parts.into_iter().collect();
        match parts.len() {
            0 => Expr::Const(false),
            1 => parts.remove(0),
            _ => Expr::Or(parts),
        }
    }

    pub fn eval(&self, ev: &EventRecord) -> bool {
        match self {
            Expr::Const(b) => *b,
            Expr::Compare { lhs, op, rhs } => op.apply(lhs.eval(ev), rhs.eval(ev)),
            Expr::RunRange(iv) => iv.contains(ev.run),
            Expr::And(parts) => parts.iter().all(|p| p.eval(ev)),
            Expr::Or(parts) => parts.iter().any(|p| p.eval(ev)),
            Expr::Not(inner) => !inner.eval(ev),
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn join(f: &mut fmt::Formatter<'_>, parts: &[Expr], sep: &str) -> fmt::Result {
            f.write_str("(")?;
            for (i, p) in parts.iter().enumerate() {
                if i > 0 {
                    f.write_str(sep)?;
                }
                write!(f, "{p}")?;
            }
            f.write_str(")")
        }
        match self {
            Expr::Const(b) => write!(f, "{}", if *b { "1" } else { "0" }),
            Expr::Compare { lhs, op, rhs } => write!(f, "{lhs}{}{rhs}", op.symbol()),
            Expr::RunRange(iv) => write!(f, "run>={} && run<={}", iv.lo, iv.hi),
            Expr::And(parts) => join(f, parts, " && "),
            Expr::Or(parts) => join(f, parts, " || "),
            Expr::Not(inner) => write!(f, "!({inner})"),
        }
    }
}

/// Return indices of events that pass their predicate.
///
/// `predicate_for` picks the predicate for an event (typically by run and
/// channel); an event with no predicate fails.
pub fn filtered_indices<'a, F>(events: &[EventRecord], predicate_for: F) -> Vec<usize>
where
    F: Fn(&EventRecord) -> Option<&'a Expr>,
{
    events
        .iter()
        .enumerate()
        .filter(|(_, ev)| predicate_for(ev).is_some_and(|p| p.eval(ev)))
        .map(|(i, _)| i)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ev(run: u32, energy: f64, fit_slo: f64, rise_noise: f64) -> EventRecord {
        EventRecord {
            run,
            channel: 592,
            energy,
            fit_slo,
            rise_noise,
        }
    }

    #[test]
    fn threshold_and_slope() {
        let cut = Expr::all([Expr::threshold(1.5), Expr::slope(20.0)]);
        assert!(cut.eval(&ev(1, 2.0, 10.0, 0.0)));
        assert!(!cut.eval(&ev(1, 1.0, 10.0, 0.0)));
        assert!(!cut.eval(&ev(1, 2.0, 25.0, 0.0)));
    }

    #[test]
    fn rise_noise_polynomial() {
        // riseNoise < 0.01*E^2 + 0.1*E + 2
        let cut = Expr::rise_noise(0.01, 0.1, 2.0);
        // at E=10: 1 + 1 + 2 = 4
        assert!(cut.eval(&ev(1, 10.0, 0.0, 3.9)));
        assert!(!cut.eval(&ev(1, 10.0, 0.0, 4.1)));
    }

    #[test]
    fn or_across_run_windows() {
        let cut = Expr::any([
            Expr::all([Expr::RunRange(RunInterval::new(10, 20)), Expr::threshold(1.0)]),
            Expr::all([Expr::RunRange(RunInterval::new(21, 30)), Expr::threshold(5.0)]),
        ]);
        assert!(cut.eval(&ev(15, 2.0, 0.0, 0.0)));
        assert!(!cut.eval(&ev(25, 2.0, 0.0, 0.0)));
        assert!(cut.eval(&ev(25, 6.0, 0.0, 0.0)));
        assert!(!cut.eval(&ev(40, 6.0, 0.0, 0.0)));
    }

    #[test]
    fn empty_combinators() {
        assert_eq!(Expr::any([]), Expr::Const(false));
        assert_eq!(Expr::all([]), Expr::Const(true));
        assert!(Expr::Not(Box::new(Expr::Const(false))).eval(&ev(1, 0.0, 0.0, 0.0)));
    }

    #[test]
    fn renders_text_form() {
        let cut = Expr::all([Expr::RunRange(RunInterval::new(10, 20)), Expr::slope(12.5)]);
        assert_eq!(cut.to_string(), "(run>=10 && run<=20 && fitSlo<12.500)");
    }

    #[test]
    fn filtered_indices_skips_events_without_predicate() {
        let pass = Expr::threshold(1.0);
        let events = [ev(1, 2.0, 0.0, 0.0), ev(2, 0.5, 0.0, 0.0), ev(3, 2.0, 0.0, 0.0)];
        let idx = filtered_indices(&events, |e| (e.run != 3).then_some(&pass));
        assert_eq!(idx, vec![0]);
    }
}

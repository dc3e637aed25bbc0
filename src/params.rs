use std::fmt;

pub type Value = i32;

pub const INITIAL_STEP: Value = 16;

/// How a tuning variable maps onto the engine's option names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamKind {
    Scalar { name: String },
    ArrayElement { base_name: String, index: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Up,
    Down,
}

impl Direction {
    pub fn sign(self) -> Value {
        match self {
            Direction::Up => 1,
            Direction::Down => -1,
        }
    }

    pub fn flipped(self) -> Self {
        match self {
            Direction::Up => Direction::Down,
            Direction::Down => Direction::Up,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TuningParameter {
    pub kind: ParamKind,
    pub value: Value,
    /// Always 16, 4 or 1.
    pub step: Value,
    pub direction: Direction,
    pub improvements: u32,
    pub iterations: u32,
    /// Rounds left before this parameter is tried again.
    pub remaining_skips: u32,
    /// Consecutive failures at step 1, drives the skip back-off.
    pub skip_streak: u32,
}

impl TuningParameter {
    pub fn scalar(name: impl Into<String>, value: Value) -> Self {
        Self::with_kind(ParamKind::Scalar { name: name.into() }, value)
    }

    pub fn element(base_name: impl Into<String>, index: usize, value: Value) -> Self {
        Self::with_kind(
            ParamKind::ArrayElement {
                base_name: base_name.into(),
                index,
            },
            value,
        )
    }

    fn with_kind(kind: ParamKind, value: Value) -> Self {
        TuningParameter {
            kind,
            value,
            step: INITIAL_STEP,
            direction: Direction::Up,
            improvements: 0,
            iterations: 0,
            remaining_skips: 0,
            skip_streak: 0,
        }
    }

    /// The option name sent to the engine. Array elements get their index appended.
    pub fn option_name(&self) -> String {
        match &self.kind {
            ParamKind::Scalar { name } => name.clone(),
            ParamKind::ArrayElement { base_name, index } => format!("{base_name}{index}"),
        }
    }

    pub fn base_name(&self) -> &str {
        match &self.kind {
            ParamKind::Scalar { name } => name,
            ParamKind::ArrayElement { base_name, .. } => base_name,
        }
    }

    /// The signed offset of the next trial in the preferred direction.
    pub fn delta(&self) -> Value {
        self.step * self.direction.sign()
    }

    pub fn record_improvement(&mut self) {
        self.improvements += 1;
        self.skip_streak = 0;
        self.remaining_skips = 0;
    }

    /// Bookkeeping after both trial directions were rejected.
    pub fn record_failure(&mut self) {
        if self.step > 1 {
            self.step = (self.step >> 2).max(1);
            if self.iterations > 1 && self.improvements == 0 {
                self.step = 1;
            }
        } else {
            self.skip_streak += 1;
            self.remaining_skips += 8 * self.skip_streak;
        }
    }
}

impl fmt::Display for TuningParameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} = {}", self.option_name(), self.value)
    }
}

/// Expands one configured entry into parameters; lists become one element per index.
pub fn expand(name: &str, values: &[Value]) -> Vec<TuningParameter> {
    values
        .iter()
        .enumerate()
        .map(|(index, &value)| TuningParameter::element(name, index, value))
        .collect()
}

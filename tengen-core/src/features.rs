//! Input planes for the dual-head network.
//!
//! Per board point the network sees 17 features: 8 pairs of binary planes
//! `[mine_t, theirs_t]` for the current position and the 7 positions before
//! it (newest first, zero-padded when the game is younger than that), plus
//! one plane that is all ones when black is to move. The layout is
//! stone-minor: all 17 features of a point are stored consecutively.

/// Number of past positions encoded in the stone planes.
pub const MOVE_HISTORY: usize = 8;

/// Features per board point.
pub const NUM_STONE_FEATURES: usize = 2 * MOVE_HISTORY + 1;

/// Index of the to-play feature within a point's feature run.
pub const PLAYER_FEATURE: usize = 2 * MOVE_HISTORY;

/// One position's input planes, flattened. Length is
/// [`BoardSpec::num_board_features`].
pub type BoardFeatures = Vec<f32>;

/// Move probabilities for one position, pass included. Length is
/// [`BoardSpec::num_moves`].
pub type Policy = Vec<f32>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Color {
    Black,
    White,
}

impl Color {
    pub fn other(self) -> Color {
        match self {
            Color::Black => Color::White,
            Color::White => Color::Black,
        }
    }
}

/// Board geometry. The network graphs are exported for 9x9 and 19x19 only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoardSpec {
    n: usize,
}

impl BoardSpec {
    pub fn new(n: usize) -> Self {
        assert!(n == 9 || n == 19, "unsupported board side: {}", n);
        BoardSpec { n }
    }

    pub fn side(&self) -> usize {
        self.n
    }

    pub fn num_points(&self) -> usize {
        self.n * self.n
    }

    /// Length of one position's flattened input planes.
    pub fn num_board_features(&self) -> usize {
        self.num_points() * NUM_STONE_FEATURES
    }

    /// Number of legal move slots, including pass.
    pub fn num_moves(&self) -> usize {
        self.num_points() + 1
    }
}

/// Stone occupancy of one board position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stones {
    points: Vec<Option<Color>>,
}

impl Stones {
    pub fn empty(spec: BoardSpec) -> Self {
        Stones {
            points: vec![None; spec.num_points()],
        }
    }

    pub fn set(&mut self, point: usize, color: Option<Color>) {
        self.points[point] = color;
    }

    pub fn get(&self, point: usize) -> Option<Color> {
        self.points[point]
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// Writes the input planes for a position history into `out`.
///
/// `history[0]` is the current position, `history[i]` the position `i` moves
/// ago. Histories shorter than [`MOVE_HISTORY`] are zero-padded.
pub fn encode_features(spec: BoardSpec, history: &[&Stones], to_play: Color, out: &mut [f32]) {
    debug_assert!(history.len() <= MOVE_HISTORY);
    debug_assert_eq!(out.len(), spec.num_board_features());

    let my_color = to_play;
    let their_color = to_play.other();

    for (step, stones) in history.iter().enumerate() {
        debug_assert_eq!(stones.len(), spec.num_points());
        for point in 0..spec.num_points() {
            let base = point * NUM_STONE_FEATURES + step * 2;
            let color = stones.get(point);
            out[base] = if color == Some(my_color) { 1.0 } else { 0.0 };
            out[base + 1] = if color == Some(their_color) { 1.0 } else { 0.0 };
        }
    }

    for step in history.len()..MOVE_HISTORY {
        for point in 0..spec.num_points() {
            let base = point * NUM_STONE_FEATURES + step * 2;
            out[base] = 0.0;
            out[base + 1] = 0.0;
        }
    }

    let to_play_feature = if to_play == Color::Black { 1.0 } else { 0.0 };
    for point in 0..spec.num_points() {
        out[point * NUM_STONE_FEATURES + PLAYER_FEATURE] = to_play_feature;
    }
}

use std::fmt;

/// One 8-bit RGBA sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rgba {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Rgba {
    pub const fn new(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self { r, g, b, a }
    }

    pub const fn opaque(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b, a: 255 }
    }

    pub fn channels(&self) -> [u8; 4] {
        [self.r, self.g, self.b, self.a]
    }
}

impl fmt::Display for Rgba {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{} {} {} {}}}", self.r, self.g, self.b, self.a)
    }
}

/// A decoded frame: `height` rows of `width` pixels, top row first.
///
/// Stored row-major in one allocation, so every row has the same length by
/// construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelGrid {
    width: u32,
    height: u32,
    pixels: Vec<Rgba>,
}

impl PixelGrid {
    /// A grid of `width * height` copies of `fill`.
    pub fn filled(width: u32, height: u32, fill: Rgba) -> Self {
        Self {
            width,
            height,
            pixels: vec![fill; width as usize * height as usize],
        }
    }

    /// Build a grid from explicit rows. Returns `None` if the rows are ragged.
    pub fn from_rows(rows: Vec<Vec<Rgba>>) -> Option<Self> {
        let height = rows.len() as u32;
        let width = rows.first().map_or(0, |r| r.len()) as u32;
        if rows.iter().any(|r| r.len() as u32 != width) {
            return None;
        }
        Some(Self {
            width,
            height,
            pixels: rows.into_iter().flatten().collect(),
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn get(&self, x: u32, y: u32) -> Option<Rgba> {
        if x >= self.width || y >= self.height {
            return None;
        }
        self.pixels
            .get(y as usize * self.width as usize + x as usize)
            .copied()
    }

    pub fn pixels(&self) -> &[Rgba] {
        &self.pixels
    }

    pub fn rows(&self) -> impl Iterator<Item = &[Rgba]> {
        // chunks_exact panics on zero; an empty grid has no rows anyway.
        self.pixels.chunks_exact(self.width.max(1) as usize)
    }

    pub(crate) fn row_mut(&mut self, y: u32) -> &mut [Rgba] {
        let start = y as usize * self.width as usize;
        &mut self.pixels[start..start + self.width as usize]
    }
}

/// Text dump: one line per row, pixels separated by `, `.
impl fmt::Display for PixelGrid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for row in self.rows() {
            for (i, px) in row.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{px}")?;
            }
            f.write_str("\n")?;
        }
        Ok(())
    }
}

/// Outcome of comparing two grids pixel by pixel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MatchResult {
    pub pass: u64,
    pub fail: u64,
}

impl MatchResult {
    pub fn total(&self) -> u64 {
        self.pass + self.fail
    }

    /// `100 * pass / (pass + fail)`, or `None` when nothing was compared.
    pub fn match_percent(&self) -> Option<f64> {
        match self.total() {
            0 => None,
            total => Some(100.0 * self.pass as f64 / total as f64),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_rows_rejects_ragged_input() {
        let px = Rgba::opaque(1, 2, 3);
        assert!(PixelGrid::from_rows(vec![vec![px, px], vec![px]]).is_none());
        let grid = PixelGrid::from_rows(vec![vec![px, px], vec![px, px]]).unwrap();
        assert_eq!(grid.dimensions(), (2, 2));
    }

    #[test]
    fn get_is_bounds_checked() {
        let grid = PixelGrid::filled(3, 2, Rgba::opaque(9, 9, 9));
        assert_eq!(grid.get(2, 1), Some(Rgba::opaque(9, 9, 9)));
        assert_eq!(grid.get(3, 0), None);
        assert_eq!(grid.get(0, 2), None);
    }

    #[test]
    fn display_dumps_rows() {
        let grid = PixelGrid::from_rows(vec![
            vec![Rgba::new(255, 0, 0, 255), Rgba::new(0, 255, 0, 255)],
            vec![Rgba::new(0, 0, 255, 128), Rgba::new(1, 2, 3, 4)],
        ])
        .unwrap();
        assert_eq!(
            grid.to_string(),
            "{255 0 0 255}, {0 255 0 255}\n{0 0 255 128}, {1 2 3 4}\n"
        );
    }

    #[test]
    fn empty_result_has_no_percentage() {
        assert_eq!(MatchResult::default().match_percent(), None);
        let r = MatchResult { pass: 7, fail: 1 };
        assert_eq!(r.match_percent(), Some(87.5));
    }
}

use bytemuck::{Pod, Zeroable};
use glam::IVec2;
use octosplat_lib::{math::bounds::IBounds2, octree::Rgb8};

/// A single depth and color sample.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Pod, Zeroable)]
pub struct Pixel {
    /// Fixed point depth, lower is nearer.
    pub depth: i32,
    pub color: [u8; 4],
}

impl Pixel {
    /// Nothing was drawn yet.
    pub const EMPTY: Self = Self {
        depth: i32::MAX,
        color: [0; 4],
    };

    pub fn new(depth: i32, color: Rgb8) -> Self {
        let [r, g, b] = color.to_array();
        Self {
            depth,
            color: [r, g, b, 255],
        }
    }

    pub fn is_empty(self) -> bool {
        self.depth == i32::MAX
    }

    pub fn rgb(self) -> Rgb8 {
        let [r, g, b, _] = self.color;
        Rgb8::new(r, g, b)
    }
}

impl Default for Pixel {
    fn default() -> Self {
        Self::EMPTY
    }
}

/// A row-major grid of [`Pixel`]s that all instances of a frame are rendered into.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FrameBuffer {
    width: u32,
    height: u32,
    pixels: Vec<Pixel>,
}

impl FrameBuffer {
    /// The largest supported width and height.
    pub const MAX_SIZE: u32 = 1 << 15;

    /// Constructs an empty [`FrameBuffer`].
    ///
    /// # Panics
    ///
    /// Panics if `width` or `height` exceeds [`FrameBuffer::MAX_SIZE`].
    pub fn new(width: u32, height: u32) -> Self {
        assert!(
            width <= Self::MAX_SIZE && height <= Self::MAX_SIZE,
            "frame buffer size should not exceed 32768"
        );
        Self {
            width,
            height,
            pixels: vec![Pixel::EMPTY; width as usize * height as usize],
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// All pixels of the buffer.
    pub fn bounds(&self) -> IBounds2 {
        IBounds2::with_size_at_origin(IVec2::new(self.width as i32, self.height as i32))
    }

    /// Resets every pixel to [`Pixel::EMPTY`].
    pub fn clear(&mut self) {
        self.pixels.fill(Pixel::EMPTY);
    }

    /// Returns [`None`] if the position lies outside of the buffer.
    pub fn get(&self, x: u32, y: u32) -> Option<Pixel> {
        (x < self.width && y < self.height).then(|| self.pixels[self.index(x, y)])
    }

    pub fn pixels(&self) -> &[Pixel] {
        &self.pixels
    }

    pub fn row(&self, y: u32) -> &[Pixel] {
        let start = (y * self.width) as usize;
        &self.pixels[start..start + self.width as usize]
    }

    /// The pixels of row `y` within the columns of `bounds`.
    pub(crate) fn row_span_mut(&mut self, y: i32, bounds: IBounds2) -> &mut [Pixel] {
        let start = y as usize * self.width as usize;
        &mut self.pixels[start + bounds.lower().x as usize..start + bounds.upper().x as usize]
    }

    pub(crate) fn row_span(&self, y: i32, bounds: IBounds2) -> &[Pixel] {
        let start = y as usize * self.width as usize;
        &self.pixels[start + bounds.lower().x as usize..start + bounds.upper().x as usize]
    }

    /// Colors as tightly packed RGBA bytes, row by row.
    pub fn to_rgba(&self) -> Vec<u8> {
        self.pixels.iter().flat_map(|pixel| pixel.color).collect()
    }

    fn index(&self, x: u32, y: u32) -> usize {
        y as usize * self.width as usize + x as usize
    }
}

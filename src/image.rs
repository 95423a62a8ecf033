// image.rs — Detector frame container, generic over pixel type.
//
// Detectors deliver integer counts (u8/u16/u32, sometimes signed after
// pedestal subtraction) or already-converted floats. The engine works on
// f32 intensities, so the only thing a pixel type must provide is a lossless
// enough widening to f32.
//
// Memory layout (stride = 5, width = 4):
//
//   data index:  0  1  2  3 [4]  5  6  7  8 [9] 10 11 12 13 [14]
//   pixel:       ■  ■  ■  ■  ·   ■  ■  ■  ■  ·   ■  ■  ■  ■  ·
//   row:         |--- row 0 ---|  |--- row 1 ---|  |--- row 2 ---|
//
// Padding elements are never integrated. `to_f32_vec` returns the
// row-major pixels without padding, which is the order bin maps use.

use std::fmt;

use crate::error::{IntegrationError, Result};

/// A value that can be stored in an [`Image`] and integrated.
pub trait Pixel: Copy + Default + Send + Sync + 'static {
    /// Intensity as f32 (raw value, not normalized).
    fn to_f32(self) -> f32;
}

macro_rules! impl_pixel {
    ($($t:ty),*) => {
        $(
            impl Pixel for $t {
                #[inline]
                fn to_f32(self) -> f32 {
                    self as f32
                }
            }
        )*
    };
}

impl_pixel!(u8, u16, u32, i32, f32, f64);

/// A 2D image, row-major with explicit stride.
#[derive(Clone)]
pub struct Image<T: Pixel> {
    data: Vec<T>,
    width: usize,
    height: usize,
    /// Row stride in elements. `stride >= width`.
    stride: usize,
}

impl<T: Pixel> Image<T> {
    /// Zero-initialized image.
    pub fn new(width: usize, height: usize) -> Self {
        Image {
            data: vec![T::default(); width * height],
            width,
            height,
            stride: width,
        }
    }

    /// Wrap tightly packed row-major data.
    pub fn from_vec(width: usize, height: usize, data: Vec<T>) -> Result<Self> {
        Self::from_vec_with_stride(width, height, width, data)
    }

    /// Wrap row-major data whose rows are `stride` elements apart.
    pub fn from_vec_with_stride(
        width: usize,
        height: usize,
        stride: usize,
        data: Vec<T>,
    ) -> Result<Self> {
        if stride < width {
            return Err(IntegrationError::InvalidConfiguration(format!(
                "stride ({stride}) must be >= width ({width})"
            )));
        }
        if data.len() != height * stride {
            return Err(IntegrationError::shape("image buffer", height * stride, data.len()));
        }
        Ok(Image {
            data,
            width,
            height,
            stride,
        })
    }

    #[inline]
    pub fn width(&self) -> usize {
        self.width
    }

    #[inline]
    pub fn height(&self) -> usize {
        self.height
    }

    #[inline]
    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Number of real pixels (`width * height`).
    pub fn pixel_count(&self) -> usize {
        self.width * self.height
    }

    /// Pixel at column `x`, row `y`, or `None` when out of bounds.
    #[inline]
    pub fn get(&self, x: usize, y: usize) -> Option<T> {
        (x < self.width && y < self.height).then(|| self.data[y * self.stride + x])
    }

    /// Set the pixel at (x, y). Returns false when out of bounds.
    pub fn set(&mut self, x: usize, y: usize, value: T) -> bool {
        if x < self.width && y < self.height {
            self.data[y * self.stride + x] = value;
            true
        } else {
            false
        }
    }

    /// Row `y` without padding.
    pub fn row(&self, y: usize) -> &[T] {
        let start = y * self.stride;
        &self.data[start..start + self.width]
    }

    /// Row-major f32 intensities, padding removed.
    pub fn to_f32_vec(&self) -> Vec<f32> {
        let mut out = Vec::with_capacity(self.pixel_count());
        for y in 0..self.height {
            out.extend(self.row(y).iter().map(|p| p.to_f32()));
        }
        out
    }
}

impl<T: Pixel + fmt::Debug> fmt::Debug for Image<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Image<{}> {{ {}×{}, stride={} }}",
            std::any::type_name::<T>(),
            self.width,
            self.height,
            self.stride,
        )?;
        for y in 0..self.height.min(8) {
            let row = self.row(y);
            write!(f, "  row {y}: {:?}", &row[..row.len().min(16)])?;
            if self.width > 16 {
                write!(f, " ...")?;
            }
            writeln!(f)?;
        }
        if self.height > 8 {
            writeln!(f, "  ...")?;
        }
        Ok(())
    }
}

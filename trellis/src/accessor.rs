use std::fmt;

use bytemuck::pod_read_unaligned;
use glam::{Vec2, Vec3, Vec4};

/// Component layout of an accessor's elements.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Format {
    F32,
    F32x2,
    F32x3,
    F32x4,
    U8x4Norm,
    U16,
    U16x4Norm,
    U32,
}

impl Format {
    /// Size of one element, in bytes.
    pub fn size(&self) -> usize {
        match self {
            Format::F32 => 4,
            Format::F32x2 => 8,
            Format::F32x3 => 12,
            Format::F32x4 => 16,
            Format::U8x4Norm => 4,
            Format::U16 => 2,
            Format::U16x4Norm => 8,
            Format::U32 => 4,
        }
    }
}

/// Typed view into one of the scene's binary buffers.
///
/// `stride` is the distance between consecutive elements; zero means
/// tightly packed. A stride larger than the element size reads an
/// attribute out of interleaved vertex data.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Accessor {
    pub buffer: u32,
    pub offset: usize,
    pub count: u32,
    pub stride: usize,
    pub format: Format,
}

impl Accessor {
    /// Tightly-packed accessor over a whole buffer.
    pub fn packed(buffer: u32, count: u32, format: Format) -> Self {
        Self { buffer, offset: 0, count, stride: 0, format }
    }

    pub fn read_vec2s(
        &self,
        buffers: &[Vec<u8>],
    ) -> Result<Vec<Vec2>, AccessorError> {
        if self.format != Format::F32x2 {
            return Err(AccessorError::WrongFormat(self.format));
        }

        self.read(buffers, |bytes| {
            Vec2::new(
                pod_read_unaligned(&bytes[0..4]),
                pod_read_unaligned(&bytes[4..8]),
            )
        })
    }

    pub fn read_vec3s(
        &self,
        buffers: &[Vec<u8>],
    ) -> Result<Vec<Vec3>, AccessorError> {
        if self.format != Format::F32x3 {
            return Err(AccessorError::WrongFormat(self.format));
        }

        self.read(buffers, |bytes| {
            Vec3::new(
                pod_read_unaligned(&bytes[0..4]),
                pod_read_unaligned(&bytes[4..8]),
                pod_read_unaligned(&bytes[8..12]),
            )
        })
    }

    pub fn read_vec4s(
        &self,
        buffers: &[Vec<u8>],
    ) -> Result<Vec<Vec4>, AccessorError> {
        if self.format != Format::F32x4 {
            return Err(AccessorError::WrongFormat(self.format));
        }

        self.read(buffers, read_vec4)
    }

    /// Reads an index stream, widening `u16` indices to `u32`.
    pub fn read_indices(
        &self,
        buffers: &[Vec<u8>],
    ) -> Result<Vec<u32>, AccessorError> {
        match self.format {
            Format::U16 => self.read(buffers, |bytes| {
                u32::from(pod_read_unaligned::<u16>(&bytes[0..2]))
            }),
            Format::U32 => {
                self.read(buffers, |bytes| pod_read_unaligned(&bytes[0..4]))
            }
            format => Err(AccessorError::WrongFormat(format)),
        }
    }

    /// Reads a color stream, normalizing every supported layout to RGBA
    /// floats in `0.0 ..= 1.0` (assuming normalized integer sources).
    pub fn read_colors(
        &self,
        buffers: &[Vec<u8>],
    ) -> Result<Vec<Vec4>, AccessorError> {
        match self.format {
            Format::F32x3 => Ok(self
                .read_vec3s(buffers)?
                .into_iter()
                .map(|color| color.extend(1.0))
                .collect()),

            Format::F32x4 => self.read(buffers, read_vec4),

            Format::U8x4Norm => self.read(buffers, |bytes| {
                Vec4::new(
                    f32::from(bytes[0]),
                    f32::from(bytes[1]),
                    f32::from(bytes[2]),
                    f32::from(bytes[3]),
                ) / 255.0
            }),

            Format::U16x4Norm => self.read(buffers, |bytes| {
                Vec4::new(
                    f32::from(pod_read_unaligned::<u16>(&bytes[0..2])),
                    f32::from(pod_read_unaligned::<u16>(&bytes[2..4])),
                    f32::from(pod_read_unaligned::<u16>(&bytes[4..6])),
                    f32::from(pod_read_unaligned::<u16>(&bytes[6..8])),
                ) / 65535.0
            }),

            format => Err(AccessorError::WrongFormat(format)),
        }
    }

    fn read<T>(
        &self,
        buffers: &[Vec<u8>],
        parse: impl Fn(&[u8]) -> T,
    ) -> Result<Vec<T>, AccessorError> {
        let (window, stride) = self.validate(buffers)?;
        let elem = self.format.size();

        Ok((0..self.count as usize)
            .map(|i| parse(&window[i * stride..i * stride + elem]))
            .collect())
    }

    /// Bounds-checks the accessor and returns its byte window plus the
    /// effective stride.
    fn validate<'a>(
        &self,
        buffers: &'a [Vec<u8>],
    ) -> Result<(&'a [u8], usize), AccessorError> {
        let data = buffers
            .get(self.buffer as usize)
            .ok_or(AccessorError::UnknownBuffer(self.buffer))?;

        let elem = self.format.size();

        let stride = match self.stride {
            0 => elem,
            stride if stride < elem => {
                return Err(AccessorError::BadStride(stride));
            }
            stride => stride,
        };

        if self.count == 0 {
            return Ok((&[], stride));
        }

        let end = (self.count as usize - 1)
            .checked_mul(stride)
            .and_then(|last| last.checked_add(elem))
            .and_then(|span| span.checked_add(self.offset))
            .ok_or(AccessorError::OutOfBounds)?;

        if end > data.len() {
            return Err(AccessorError::OutOfBounds);
        }

        Ok((&data[self.offset..], stride))
    }
}

fn read_vec4(bytes: &[u8]) -> Vec4 {
    Vec4::new(
        pod_read_unaligned(&bytes[0..4]),
        pod_read_unaligned(&bytes[4..8]),
        pod_read_unaligned(&bytes[8..12]),
        pod_read_unaligned(&bytes[12..16]),
    )
}

/// Why a primitive's data couldn't be extracted.
///
/// These are data errors: the primitive gets skipped and flagged, the
/// scene load carries on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessorError {
    /// The referenced accessor id is not in the scene.
    UnknownAccessor(u32),

    /// The accessor's buffer id is not in the scene.
    UnknownBuffer(u32),

    /// The accessor's byte range sticks out of its buffer.
    OutOfBounds,

    /// The stride is smaller than one element.
    BadStride(usize),

    /// The accessor's format doesn't fit the attribute it is used for.
    WrongFormat(Format),
}

impl fmt::Display for AccessorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessorError::UnknownAccessor(id) => {
                write!(f, "accessor {} doesn't exist", id)
            }
            AccessorError::UnknownBuffer(id) => {
                write!(f, "buffer {} doesn't exist", id)
            }
            AccessorError::OutOfBounds => {
                write!(f, "accessor extends past the end of its buffer")
            }
            AccessorError::BadStride(stride) => {
                write!(f, "stride of {} bytes is smaller than one element", stride)
            }
            AccessorError::WrongFormat(format) => {
                write!(f, "unexpected format {:?}", format)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_tightly_packed_vectors() {
        let buffers = vec![bytemuck::cast_slice(&[
            1.0f32, 2.0, 3.0, //
            4.0, 5.0, 6.0,
        ])
        .to_vec()];

        let accessor = Accessor::packed(0, 2, Format::F32x3);

        assert_eq!(
            vec![Vec3::new(1.0, 2.0, 3.0), Vec3::new(4.0, 5.0, 6.0)],
            accessor.read_vec3s(&buffers).unwrap(),
        );
    }

    #[test]
    fn reads_interleaved_attributes() {
        // Two vertices of [position, uv], interleaved
        let buffers = vec![bytemuck::cast_slice(&[
            1.0f32, 2.0, 3.0, 0.25, 0.75, //
            4.0, 5.0, 6.0, 0.5, 1.0,
        ])
        .to_vec()];

        let positions = Accessor {
            buffer: 0,
            offset: 0,
            count: 2,
            stride: 20,
            format: Format::F32x3,
        };

        let uvs = Accessor {
            buffer: 0,
            offset: 12,
            count: 2,
            stride: 20,
            format: Format::F32x2,
        };

        assert_eq!(
            vec![Vec3::new(1.0, 2.0, 3.0), Vec3::new(4.0, 5.0, 6.0)],
            positions.read_vec3s(&buffers).unwrap(),
        );

        assert_eq!(
            vec![Vec2::new(0.25, 0.75), Vec2::new(0.5, 1.0)],
            uvs.read_vec2s(&buffers).unwrap(),
        );
    }

    #[test]
    fn widens_u16_indices() {
        let buffers = vec![bytemuck::cast_slice(&[0u16, 1, 2, 65535]).to_vec()];
        let accessor = Accessor::packed(0, 4, Format::U16);

        assert_eq!(
            vec![0, 1, 2, 65535],
            accessor.read_indices(&buffers).unwrap(),
        );
    }

    #[test]
    fn normalizes_u8_colors() {
        let buffers = vec![vec![255, 0, 51, 255]];
        let accessor = Accessor::packed(0, 1, Format::U8x4Norm);

        let colors = accessor.read_colors(&buffers).unwrap();

        assert_eq!(Vec4::new(1.0, 0.0, 0.2, 1.0), colors[0]);
    }

    #[test]
    fn extends_rgb_colors_with_opaque_alpha() {
        let buffers = vec![bytemuck::cast_slice(&[0.5f32, 0.25, 1.0]).to_vec()];
        let accessor = Accessor::packed(0, 1, Format::F32x3);

        assert_eq!(
            vec![Vec4::new(0.5, 0.25, 1.0, 1.0)],
            accessor.read_colors(&buffers).unwrap(),
        );
    }

    #[test]
    fn rejects_reads_past_the_buffer() {
        let buffers = vec![vec![0; 23]];
        let accessor = Accessor::packed(0, 2, Format::F32x3);

        assert_eq!(
            Err(AccessorError::OutOfBounds),
            accessor.read_vec3s(&buffers),
        );
    }

    #[test]
    fn rejects_unknown_buffers() {
        let accessor = Accessor::packed(7, 1, Format::F32x3);

        assert_eq!(
            Err(AccessorError::UnknownBuffer(7)),
            accessor.read_vec3s(&[]),
        );
    }

    #[test]
    fn rejects_wrong_formats() {
        let buffers = vec![vec![0; 16]];
        let accessor = Accessor::packed(0, 1, Format::F32x4);

        assert_eq!(
            Err(AccessorError::WrongFormat(Format::F32x4)),
            accessor.read_indices(&buffers),
        );
    }

    #[test]
    fn rejects_undersized_strides() {
        let buffers = vec![vec![0; 64]];

        let accessor = Accessor {
            buffer: 0,
            offset: 0,
            count: 2,
            stride: 8,
            format: Format::F32x3,
        };

        assert_eq!(
            Err(AccessorError::BadStride(8)),
            accessor.read_vec3s(&buffers),
        );
    }

    #[test]
    fn empty_accessors_read_as_empty() {
        let accessor = Accessor::packed(0, 0, Format::U32);

        assert_eq!(Ok(Vec::new()), accessor.read_indices(&[Vec::new()]));
    }
}

use crate::network::VideoPacketHeader;
use crate::network::protocol::Size;

/// Tightly packed RGBA picture as it comes out of the decoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedPicture {
    pub width: u32,
    pub height: u32,
    pub rgba: Vec<u8>,
}

/// Displayable snapshot of one display.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoFrame {
    pub display_id: i32,
    /// Size of `pixels` after trimming and rotation.
    pub size: Size,
    /// RGBA, row-major, `size.width * 4` bytes per row.
    pub pixels: Vec<u8>,
    /// Display size reported by the device.
    pub display_size: Size,
    pub orientation: i32,
    pub orientation_correction: i32,
    pub round: bool,
    pub frame_number: u32,
    pub origination_timestamp_us: i64,
    pub bit_rate: i32,
}

impl VideoFrame {
    pub fn pixel(&self, x: i32, y: i32) -> [u8; 4] {
        let i = ((y * self.size.width + x) * 4) as usize;
        [
            self.pixels[i],
            self.pixels[i + 1],
            self.pixels[i + 2],
            self.pixels[i + 3],
        ]
    }
}

/// Region of a picture that holds the display image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Strips the padding the encoder adds to reach its block size.
///
/// The picture keeps the aspect ratio of `display`; whichever dimension is
/// too large is cut back and the image is centered in it.
pub fn trim_padding(picture_width: u32, picture_height: u32, display: Size) -> CropRect {
    let full = CropRect {
        x: 0,
        y: 0,
        width: picture_width,
        height: picture_height,
    };
    if display.width <= 0 || display.height <= 0 || picture_width == 0 || picture_height == 0 {
        return full;
    }
    let (dw, dh) = (display.width as u64, display.height as u64);
    let (pw, ph) = (picture_width as u64, picture_height as u64);
    let image_height = ((pw * dh + dw / 2) / dw) as u32;
    if image_height < picture_height {
        return CropRect {
            y: (picture_height - image_height) / 2,
            height: image_height.max(1),
            ..full
        };
    }
    let image_width = ((ph * dw + dh / 2) / dh) as u32;
    if image_width < picture_width {
        return CropRect {
            x: (picture_width - image_width) / 2,
            width: image_width.max(1),
            ..full
        };
    }
    full
}

/// Copies `crop` out of `picture` rotated counterclockwise by `quadrants`
/// quarter turns into `out`, returning the resulting size.
pub fn rotate_into(picture: &DecodedPicture, crop: CropRect, quadrants: i32, out: &mut Vec<u8>) -> Size {
    let q = quadrants.rem_euclid(4);
    let (cw, ch) = (crop.width as usize, crop.height as usize);
    let (ow, oh) = if q % 2 == 0 { (cw, ch) } else { (ch, cw) };
    let src_stride = picture.width as usize * 4;

    out.clear();
    out.resize(ow * oh * 4, 0);
    for sy in 0..ch {
        let row = (crop.y as usize + sy) * src_stride + crop.x as usize * 4;
        for sx in 0..cw {
            let (dx, dy) = match q {
                0 => (sx, sy),
                1 => (sy, cw - 1 - sx),
                2 => (cw - 1 - sx, ch - 1 - sy),
                _ => (ch - 1 - sy, sx),
            };
            let s = row + sx * 4;
            let d = (dy * ow + dx) * 4;
            out[d..d + 4].copy_from_slice(&picture.rgba[s..s + 4]);
        }
    }
    Size::new(ow as i32, oh as i32)
}

/// Clears every pixel outside the ellipse inscribed in the image.
pub fn clip_to_ellipse(pixels: &mut [u8], size: Size) {
    let (w, h) = (size.width as f64, size.height as f64);
    if w <= 0.0 || h <= 0.0 {
        return;
    }
    let (rx, ry) = (w / 2.0, h / 2.0);
    for y in 0..size.height {
        let dy = (y as f64 + 0.5 - ry) / ry;
        for x in 0..size.width {
            let dx = (x as f64 + 0.5 - rx) / rx;
            if dx * dx + dy * dy > 1.0 {
                let i = ((y * size.width + x) * 4) as usize;
                pixels[i..i + 4].fill(0);
            }
        }
    }
}

/// Turns a decoded picture into the display's current frame.
///
/// When `current` already has the resulting size and rotation its pixel
/// buffer is overwritten in place; otherwise a new frame replaces it.
/// Returns true when the buffer was reused.
pub fn compose_frame(
    current: &mut Option<VideoFrame>,
    picture: &DecodedPicture,
    header: &VideoPacketHeader,
) -> bool {
    let correction = header.orientation_correction as i32;
    let display_size = Size::new(header.width, header.height);
    let crop = trim_padding(
        picture.width,
        picture.height,
        display_size.rotated_by_quadrants(correction),
    );
    let output_size = Size::new(crop.width as i32, crop.height as i32).rotated_by_quadrants(correction);

    let reusable = current
        .as_ref()
        .is_some_and(|f| f.size == output_size && f.orientation_correction == correction);

    let mut pixels = match current.take() {
        Some(frame) if reusable => frame.pixels,
        _ => Vec::new(),
    };
    let size = rotate_into(picture, crop, correction, &mut pixels);
    let round = header.is_round_display();
    if round {
        clip_to_ellipse(&mut pixels, size);
    }

    *current = Some(VideoFrame {
        display_id: header.display_id,
        size,
        pixels,
        display_size,
        orientation: header.orientation as i32,
        orientation_correction: correction,
        round,
        frame_number: header.frame_number,
        origination_timestamp_us: header.origination_timestamp_us,
        bit_rate: header.bit_rate,
    });
    reusable
}

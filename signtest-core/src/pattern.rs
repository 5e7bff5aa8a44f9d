//! Deterministic smoke-test image sent to the FPGA after boot.
//!
//! Blue sweeps once around the centre, green falls off with radius and red
//! ramps down the image, so a miswired colour channel or a swapped row is
//! obvious on the panel.

use core::f64::consts::TAU;

use crate::protocol::{IMAGE_PIXELS, IMAGE_SIDE};

/// Builds the 32x32 smoke-test pattern as `0x00RRGGBB` pixels.
///
/// Channel values round half to even.
#[must_use]
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
pub fn smoke_test_pattern() -> [u32; IMAGE_PIXELS] {
    let mut image = [0u32; IMAGE_PIXELS];
    let centre = (IMAGE_SIDE / 2) as f64;

    for (index, pixel) in image.iter_mut().enumerate() {
        let x = index % IMAGE_SIDE;
        let y = index / IMAGE_SIDE;
        let dx = x as f64 - centre;
        let dy = centre - y as f64;

        let mut angle = dx.atan2(dy) / TAU;
        if angle < 0.0 {
            angle += 1.0;
        }
        let a = channel(angle * 127.0);
        let r = channel(160.0 - dx.hypot(dy) * 8.0);
        let z = channel(((x + IMAGE_SIDE * y) * 191 / 1024) as f64);

        *pixel = a | (r << 8) | (z << 16);
    }
    image
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn channel(value: f64) -> u32 {
    value.round_ties_even().clamp(0.0, 255.0) as u32
}

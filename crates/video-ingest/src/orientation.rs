/// Rotate a packed 3-byte-per-pixel frame by 180 degrees in place.
pub fn rotate_180_bgr(data: &mut [u8]) {
    let pixels = data.len() / 3;
    for i in 0..pixels / 2 {
        let j = pixels - 1 - i;
        for c in 0..3 {
            data.swap(i * 3 + c, j * 3 + c);
        }
    }
}

//! Photo derivation tests.

#[cfg(test)]
mod tests {
    use cyberspace_world::photo::{derive_photo_variants, PhotoError};
    use image::GenericImageView;

    fn jpeg_of_size(w: u32, h: u32) -> Vec<u8> {
        let img = image::RgbImage::from_fn(w, h, |x, y| {
            image::Rgb([(x % 256) as u8, (y % 256) as u8, 128])
        });
        let mut out = Vec::new();
        let mut encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, 90);
        encoder.encode_image(&img).unwrap();
        out
    }

    #[test]
    fn large_photo_yields_midsize_and_thumbnail() {
        let data = jpeg_of_size(2000, 1500);
        let variants = derive_photo_variants(&data).unwrap();

        assert_eq!((variants.width, variants.height), (2000, 1500));

        let midsize = image::load_from_memory(variants.midsize.as_ref().unwrap()).unwrap();
        assert_eq!(midsize.dimensions(), (1000, 750));

        let thumb = image::load_from_memory(&variants.thumbnail).unwrap();
        assert_eq!(thumb.dimensions(), (230, 172));
    }

    #[test]
    fn small_photo_skips_midsize() {
        let data = jpeg_of_size(640, 480);
        let variants = derive_photo_variants(&data).unwrap();
        assert!(variants.midsize.is_none(), "source already under 1000px");

        let thumb = image::load_from_memory(&variants.thumbnail).unwrap();
        assert_eq!(thumb.dimensions(), (230, 172));
    }

    #[test]
    fn wide_photo_is_centre_cropped_for_thumbnail() {
        // 4000x1000 is much wider than 4:3; the thumbnail must still come
        // out at exactly 230x172.
        let data = jpeg_of_size(4000, 1000);
        let variants = derive_photo_variants(&data).unwrap();
        let thumb = image::load_from_memory(&variants.thumbnail).unwrap();
        assert_eq!(thumb.dimensions(), (230, 172));
    }

    #[test]
    fn tiny_image_is_rejected() {
        let data = jpeg_of_size(4, 4);
        assert!(matches!(
            derive_photo_variants(&data),
            Err(PhotoError::TooSmall { .. })
        ));
    }

    #[test]
    fn garbage_bytes_are_rejected() {
        assert!(matches!(
            derive_photo_variants(b"not a jpeg at all"),
            Err(PhotoError::Decode(_))
        ));
    }
}

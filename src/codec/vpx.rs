//! VP8 and VP9 decoding through libvpx

use std::mem::MaybeUninit;
use std::os::raw::{c_int, c_uint};
use std::ptr;
use std::slice;

use tracing::warn;
use vpx_sys::{
    vpx_codec_ctx_t, vpx_codec_dec_init_ver, vpx_codec_decode, vpx_codec_destroy, vpx_codec_err_t,
    vpx_codec_get_frame, vpx_codec_iter_t, vpx_codec_vp8_dx, vpx_codec_vp9_dx, vpx_image_t, vpx_img_fmt,
    VPX_DECODER_ABI_VERSION,
};

use super::{Codec, DecodeError, FrameDecoder, YuvPicture};

pub struct VpxDecoder {
    codec: Codec,
    // Boxed so the context libvpx initialized never moves
    context: Box<vpx_codec_ctx_t>,
}

impl VpxDecoder {
    pub fn new(codec: Codec) -> Result<Self, DecodeError> {
        // SAFETY: an all-zero context is the documented pre-init state
        let mut context: Box<vpx_codec_ctx_t> = Box::new(unsafe { MaybeUninit::zeroed().assume_init() });
        let interface = match codec {
            // SAFETY: interface getters return static tables
            Codec::Vp8 => unsafe { vpx_codec_vp8_dx() },
            Codec::Vp9 => unsafe { vpx_codec_vp9_dx() },
            Codec::H264 => return Err(DecodeError::Unsupported(codec)),
        };
        // SAFETY: context points at writable memory owned by this decoder
        let status = unsafe {
            vpx_codec_dec_init_ver(
                context.as_mut(),
                interface,
                ptr::null(),
                0,
                VPX_DECODER_ABI_VERSION as c_int,
            )
        };
        if status != vpx_codec_err_t::VPX_CODEC_OK {
            return Err(DecodeError::Init(format!("libvpx returned {status:?}")));
        }
        Ok(Self { codec, context })
    }

    /// Copy one decoded image out of libvpx-owned memory
    ///
    /// # Safety
    /// `image` must come from `vpx_codec_get_frame` on this context and be
    /// used before the next decode call.
    unsafe fn picture(&self, image: &vpx_image_t) -> Result<YuvPicture, DecodeError> {
        if image.fmt != vpx_img_fmt::VPX_IMG_FMT_I420 {
            return Err(DecodeError::Malformed(format!(
                "{} produced {:?}, only 8-bit I420 is supported",
                self.codec, image.fmt
            )));
        }
        let (width, height) = (image.d_w as usize, image.d_h as usize);
        let chroma_height = height.div_ceil(2);
        let mut planes: [Vec<u8>; 3] = Default::default();
        let mut strides = [0usize; 3];
        for (plane, rows) in [height, chroma_height, chroma_height].into_iter().enumerate() {
            let stride = usize::try_from(image.stride[plane])
                .map_err(|_| DecodeError::Malformed(format!("negative stride on plane {plane}")))?;
            if image.planes[plane].is_null() {
                return Err(DecodeError::Malformed(format!("plane {plane} is missing")));
            }
            // SAFETY: libvpx guarantees stride * rows bytes per plane
            planes[plane] = unsafe { slice::from_raw_parts(image.planes[plane], stride * rows) }.to_vec();
            strides[plane] = stride;
        }
        Ok(YuvPicture {
            width: width as u32,
            height: height as u32,
            planes,
            strides,
        })
    }
}

impl FrameDecoder for VpxDecoder {
    fn decode(&mut self, payload: &[u8]) -> Result<Vec<YuvPicture>, DecodeError> {
        let length = c_uint::try_from(payload.len())
            .map_err(|_| DecodeError::Decode(format!("{} byte payload is too large", payload.len())))?;
        // SAFETY: payload outlives the call and the context is initialized
        let status = unsafe { vpx_codec_decode(self.context.as_mut(), payload.as_ptr(), length, ptr::null_mut(), 0) };
        if status != vpx_codec_err_t::VPX_CODEC_OK {
            return Err(DecodeError::Decode(format!("libvpx returned {status:?}")));
        }

        let mut pictures = Vec::new();
        let mut iter: vpx_codec_iter_t = ptr::null();
        loop {
            // SAFETY: iter is only advanced by libvpx
            let image = unsafe { vpx_codec_get_frame(self.context.as_mut(), &mut iter) };
            if image.is_null() {
                break;
            }
            // SAFETY: non-null images stay valid until the next decode
            pictures.push(unsafe { self.picture(&*image) }?);
        }
        Ok(pictures)
    }

    fn name(&self) -> &'static str {
        "libvpx"
    }
}

impl Drop for VpxDecoder {
    fn drop(&mut self) {
        // SAFETY: the context was initialized in new()
        let status = unsafe { vpx_codec_destroy(self.context.as_mut()) };
        if status != vpx_codec_err_t::VPX_CODEC_OK {
            warn!("Failed to release the {} decoder: {:?}", self.codec, status);
        }
    }
}

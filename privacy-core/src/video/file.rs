//! Recorded-clip replay through FFmpeg.

use anyhow::{Context, Result};
use ffmpeg_next as ffmpeg;
use ffmpeg_next::{format, frame, media, software::scaling};
use std::path::Path;
use tracing::info;

use super::SourceFrame;

/// Decode every video frame of `input_path` to RGB24 and hand it to
/// `on_frame` tagged with `rotation`.  Returning `false` from the callback
/// stops the replay early.  Returns the number of frames delivered.
pub fn replay<P, F>(input_path: P, rotation: u32, mut on_frame: F) -> Result<u64>
where
    P: AsRef<Path>,
    F: FnMut(SourceFrame) -> bool,
{
    ffmpeg::init().context("failed to initialise FFmpeg")?;

    let mut ictx = format::input(&input_path).context("could not open input file")?;
    let stream = ictx
        .streams()
        .best(media::Type::Video)
        .context("no video stream found in input")?;
    let stream_index = stream.index();

    let decoder_ctx = ffmpeg::codec::context::Context::from_parameters(stream.parameters())
        .context("failed to build decoder context")?;
    let mut decoder = decoder_ctx
        .decoder()
        .video()
        .context("failed to open video decoder")?;

    let (width, height) = (decoder.width(), decoder.height());
    info!(width, height, rotation, "replaying clip as live feed");

    let mut to_rgb = scaling::Context::get(
        decoder.format(),
        width,
        height,
        format::Pixel::RGB24,
        width,
        height,
        scaling::Flags::BILINEAR,
    )
    .context("failed to create to-RGB scaler")?;

    let mut decoded = frame::Video::empty();
    let mut rgb = frame::Video::empty();
    let mut delivered = 0u64;

    let mut drain = |decoder: &mut ffmpeg::decoder::Video| -> Result<bool> {
        while decoder.receive_frame(&mut decoded).is_ok() {
            to_rgb
                .run(&decoded, &mut rgb)
                .context("to-RGB scaling failed")?;

            // Drop stride padding so the frame is tightly packed.
            let stride = rgb.stride(0);
            let row_len = width as usize * 3;
            let plane = rgb.data(0);
            let mut data = Vec::with_capacity(row_len * height as usize);
            for row in 0..height as usize {
                data.extend_from_slice(&plane[row * stride..row * stride + row_len]);
            }

            let pts = decoded.pts().unwrap_or(delivered as i64);
            delivered += 1;
            if !on_frame(SourceFrame::new(data, width, height, rotation, pts)) {
                return Ok(false);
            }
        }
        Ok(true)
    };

    let mut stopped = false;
    for (stream, packet) in ictx.packets() {
        if stream.index() != stream_index {
            continue;
        }
        decoder
            .send_packet(&packet)
            .context("decoder send_packet")?;
        if !drain(&mut decoder)? {
            stopped = true;
            break;
        }
    }

    if !stopped {
        decoder.send_eof().ok();
        drain(&mut decoder)?;
    }
    info!(delivered, stopped, "replay finished");
    Ok(delivered)
}

// SPDX-License-Identifier: MIT OR Apache-2.0

use prores_encode::*;
use std::io::Write;

fn main() {
    let _time = std::time::Instant::now();

    let _ = simple_log::new(simple_log::LogConfig::default());

    let config = EncoderConfig {
        width: 640,
        height: 360,
        timescale: Rational(1001, 30000),
        display_aspect_ratio: Rational(16, 9),
        high_quality: true,
        verify_output: true,
        queue_capacity: 64,
        ..Default::default()
    };
    let frame_size = config.frame_size();
    let mut session = ProresSession::open(config).unwrap();

    // 30 frames of a drifting gradient
    let mut raw = vec![0u8; frame_size];
    for n in 0..30u32 {
        for (i, sample) in raw.chunks_exact_mut(2).enumerate() {
            let v = ((i as u32 * 37 + n * 1000) & 0xffff) as u16;
            sample.copy_from_slice(&v.to_le_bytes());
        }
        session.submit_raw(&raw).unwrap();

        while let Some(frame) = session.next_encoded_frame() {
            print_frame(&frame);
        }
    }

    session.flush().unwrap();
    while let Some(frame) = session.next_encoded_frame() {
        print_frame(&frame);
    }
    for (seq, err) in session.verification_failures() {
        println!("frame {seq}: {err}");
    }

    println!("Done in {:.3}s ", _time.elapsed().as_millis() as f64 / 1000.0);
    std::io::stdout().flush().unwrap();
}

fn print_frame(frame: &EncodedFrame) {
    match &frame.metrics {
        Some(metrics) => {
            let luma = metrics.channel(ColorChannel::Luma).unwrap();
            println!("frame {} at {:.3}s: {} bytes, luma mse {:.3}, luma psnr {:.2} dB",
                frame.seq, frame.pts.as_seconds(), frame.data.len(), luma.mse, luma.psnr);
        }
        None => {
            println!("frame {} at {:.3}s: {} bytes", frame.seq, frame.pts.as_seconds(), frame.data.len());
        }
    }
}

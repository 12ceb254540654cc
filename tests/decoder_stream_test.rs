//! Stream decoding end to end: emulated probe bytes split at random points
//!
//! The decoders keep partial frames between calls, so the events of a
//! stream must not depend on how the transport happened to chunk it.

use ppk_rs::decoder::escaped::{burst_word, encode_frame};
use ppk_rs::decoder::{
    samples_of, DecoderEvent, EscapedBurstDecoder, FixedFrameDecoder, SampleEvent,
};
use ppk_rs::emulator::{EmulatorConfig, ProbeEmulator};
use rand::prelude::*;
use rand::rngs::StdRng;

/// Split `bytes` into chunks of 1..=max_chunk bytes
fn random_chunks<'a>(bytes: &'a [u8], rng: &mut StdRng, max_chunk: usize) -> Vec<&'a [u8]> {
    let mut chunks = Vec::new();
    let mut rest = bytes;
    while !rest.is_empty() {
        let n = rng.gen_range(1..=max_chunk).min(rest.len());
        let (head, tail) = rest.split_at(n);
        chunks.push(head);
        rest = tail;
    }
    chunks
}

fn decode_fixed<'a>(chunks: impl IntoIterator<Item = &'a [u8]>) -> Vec<DecoderEvent> {
    let mut decoder = FixedFrameDecoder::with_defaults();
    let mut events = Vec::new();
    for chunk in chunks {
        events.extend(decoder.decode(chunk));
    }
    events.extend(decoder.finish());
    events
}

fn decode_escaped<'a>(chunks: impl IntoIterator<Item = &'a [u8]>) -> Vec<DecoderEvent> {
    let mut decoder = EscapedBurstDecoder::with_defaults();
    let mut events = Vec::new();
    for chunk in chunks {
        events.extend(decoder.decode(chunk));
    }
    events.extend(decoder.finish());
    events
}

fn lost(events: &[DecoderEvent]) -> u64 {
    events
        .iter()
        .map(|e| match e {
            DecoderEvent::DataLoss { missing, .. } => *missing,
            _ => 0,
        })
        .sum()
}

// ---------------------------------------------------------------------------
// Fixed-frame variant
// ---------------------------------------------------------------------------

#[test]
fn test_fixed_frame_chunking_invariant() {
    let mut emulator = ProbeEmulator::new(EmulatorConfig {
        gap_every: 700,
        gap_len: 4,
        pulse_every: 1_000,
        pulse_len: 50,
        ..EmulatorConfig::default()
    });
    let bytes = emulator.generate(5_000);
    let whole = decode_fixed([bytes.as_slice()]);

    let mut rng = StdRng::seed_from_u64(42);
    for max_chunk in [1, 3, 7, 64, 4096] {
        let split = decode_fixed(random_chunks(&bytes, &mut rng, max_chunk));
        assert_eq!(split, whole, "max_chunk {max_chunk}");
    }
}

#[test]
fn test_fixed_frame_timeline_is_gapless() {
    let mut emulator = ProbeEmulator::new(EmulatorConfig {
        gap_every: 1_000,
        gap_len: 2,
        ..EmulatorConfig::default()
    });
    let bytes = emulator.generate(4_000);
    let events = decode_fixed([bytes.as_slice()]);
    let samples = samples_of(&events);

    // 3 gaps of 2 frames each
    assert_eq!(emulator.gaps_injected(), 3);
    assert_eq!(lost(&events), 6);
    assert_eq!(samples.len(), 4_006);

    let period = samples[1].timestamp_us - samples[0].timestamp_us;
    assert!(period > 0.0);
    for (i, sample) in samples.iter().enumerate() {
        let expected = i as f64 * period;
        assert!(
            (sample.timestamp_us - expected).abs() < 1e-6 * expected.max(1.0),
            "sample {i}: {} != {expected}",
            sample.timestamp_us
        );
    }

    let placeholders: Vec<usize> = samples
        .iter()
        .enumerate()
        .filter(|(_, s)| s.is_placeholder())
        .map(|(i, _)| i)
        .collect();
    assert_eq!(placeholders.len(), 6);
    // placeholders occupy the slots of the skipped counter values
    assert_eq!(&placeholders[..2], &[1_000, 1_001]);
}

#[test]
fn test_fixed_frame_trailing_partial_frame_dropped() {
    let mut emulator = ProbeEmulator::new(EmulatorConfig::default());
    let mut bytes = emulator.generate(10);
    bytes.extend_from_slice(&[0xAA, 0xBB]);

    let samples = samples_of(&decode_fixed([bytes.as_slice()]));
    assert_eq!(samples.len(), 10);
}

// ---------------------------------------------------------------------------
// Escaped-burst variant
// ---------------------------------------------------------------------------

/// Average frames, a timestamp frame and bursts with escaped bytes
fn escaped_stream(rng: &mut StdRng) -> Vec<u8> {
    let mut bytes = Vec::new();
    for i in 0..200u32 {
        match i % 5 {
            0 => {
                let mut payload = vec![0x00];
                payload.extend_from_slice(&(i * 1_000).to_le_bytes());
                bytes.extend(encode_frame(&payload));
            }
            1 | 2 => {
                let amps: f32 = rng.gen_range(1e-7..1e-2);
                bytes.extend(encode_frame(&amps.to_le_bytes()));
            }
            _ => {
                let payload: Vec<u8> = (0..rng.gen_range(3..20))
                    .map(|_| burst_word(rng.gen_range(1..=3), rng.gen_range(0..0x3FFF)))
                    .flat_map(|w| w.to_le_bytes())
                    .collect();
                bytes.extend(encode_frame(&payload));
            }
        }
    }
    bytes
}

#[test]
fn test_escaped_chunking_invariant() {
    let mut rng = StdRng::seed_from_u64(7);
    let bytes = escaped_stream(&mut rng);
    let whole = decode_escaped([bytes.as_slice()]);
    assert!(samples_of(&whole).len() > 200);

    for max_chunk in [1, 2, 5, 33, 1024] {
        let split = decode_escaped(random_chunks(&bytes, &mut rng, max_chunk));
        assert_eq!(split, whole, "max_chunk {max_chunk}");
    }
}

#[test]
fn test_escaped_values_are_finite_and_ordered() {
    let mut rng = StdRng::seed_from_u64(99);
    let bytes = escaped_stream(&mut rng);
    let samples: Vec<SampleEvent> = samples_of(&decode_escaped([bytes.as_slice()]));

    for pair in samples.windows(2) {
        assert!(pair[1].timestamp_us >= pair[0].timestamp_us);
    }
    for sample in &samples {
        if let Some(value) = sample.value {
            assert!(value.is_finite());
        }
    }
}

#![no_main]

use std::time::Duration;

use libfuzzer_sys::fuzz_target;
use hci_flow::RetirementLog;

/// Fuzz quantile queries with arbitrary histories and cut points, NaN and
/// out-of-range values included. Results must be in range and in caller
/// order.
fuzz_target!(|data: &[u8]| {
    if data.len() < 2 {
        return;
    }
    let capacity = (data[0] as usize % 64) + 1;
    let cut_count = data[1] as usize % 8;
    let (cut_bytes, values) = data[2..].split_at((cut_count * 8).min(data.len() - 2));

    let cuts: Vec<f64> = cut_bytes
        .chunks_exact(8)
        .map(|c| f64::from_le_bytes(c.try_into().unwrap()))
        .collect();

    let mut log = RetirementLog::new(1, capacity).unwrap();
    for &v in values {
        log.retire(v as u64, Duration::from_micros(v as u64));
    }
    if let Some(got) = log.byte_count_quantiles(&cuts) {
        assert_eq!(got.len(), cuts.len());
        let max = values[values.len().saturating_sub(capacity)..]
            .iter()
            .copied()
            .max()
            .unwrap_or(0) as u64;
        assert!(got.iter().all(|&v| v <= max));
    }
});

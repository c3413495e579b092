use std::collections::HashMap;
use std::sync::OnceLock;

static ROWS: OnceLock<Vec<String>> = OnceLock::new();
static INDEX: OnceLock<HashMap<String, Vec<u64>>> = OnceLock::new();

#[cfg_attr(feature = "memprof", memprof::measure)]
fn load_rows(n: u64) -> Vec<String> {
    (0..n).map(|i| format!("row-{i}")).collect()
}

#[cfg_attr(feature = "memprof", memprof::measure)]
fn build_index(rows: &[String]) -> HashMap<String, Vec<u64>> {
    rows.iter()
        .enumerate()
        .map(|(i, row)| (row.clone(), vec![i as u64; 8]))
        .collect()
}

#[cfg_attr(feature = "memprof", memprof::measure)]
fn scratch() {
    let buf = vec![0u8; 64 * 1024];
    std::hint::black_box(&buf);
}

#[cfg_attr(feature = "memprof", memprof::main(limit = 0))]
fn main() {
    let rows = load_rows(500);
    let index = build_index(&rows);

    // scratch space is freed before returning and never shows up
    for _ in 0..3 {
        scratch();
    }

    // both outlive the session, so they are still live when the report is printed
    let _ = INDEX.set(index);
    let _ = ROWS.set(rows);
}

#[cfg_attr(feature = "memprof", memprof::measure)]
fn leaf(n: usize) -> Vec<u32> {
    vec![7; n]
}

#[cfg_attr(feature = "memprof", memprof::measure)]
fn middle() -> Vec<Vec<u32>> {
    (1..=3).map(|i| leaf(i * 100)).collect()
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    #[cfg(feature = "memprof")]
    memprof::enable(memprof::Config::new().native(true))?;

    let kept = middle();

    #[cfg(feature = "memprof")]
    {
        let mut out = Vec::new();
        memprof::dump_samples(&mut out)?;

        const MARKER: &[u8] = b"--- profile\n";
        let text_end = out
            .windows(MARKER.len())
            .position(|w| w == MARKER)
            .map(|pos| pos + MARKER.len())
            .unwrap_or(out.len());
        let text = String::from_utf8_lossy(&out[..text_end]);
        for line in text.lines() {
            println!("{line}");
        }
        println!("profile words: {}", (out.len() - text_end) / std::mem::size_of::<usize>());
    }

    std::hint::black_box(&kept);

    #[cfg(feature = "memprof")]
    memprof::disable()?;

    Ok(())
}

use std::io::Write;

#[cfg_attr(feature = "memprof", memprof::measure)]
fn parse(input: &str) -> Vec<String> {
    input.split(',').map(|s| s.trim().to_string()).collect()
}

#[cfg_attr(feature = "memprof", memprof::measure)]
fn normalize(items: Vec<String>) -> Vec<String> {
    items.into_iter().map(|s| s.to_uppercase()).collect()
}

#[cfg_attr(feature = "memprof", memprof::measure)]
fn pipeline(input: &str) -> Vec<String> {
    let parsed = parse(input);
    normalize(parsed)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    #[cfg(feature = "memprof")]
    memprof::enable(memprof::Config::new().native(true))?;

    let mut outputs = Vec::new();
    for _ in 0..4 {
        outputs.push(pipeline("alpha, beta, gamma, delta"));
    }

    #[cfg(feature = "memprof")]
    {
        let mut stdout = std::io::stdout().lock();
        memprof::dump_callgraph(&mut stdout)?;
        stdout.flush()?;
    }

    std::hint::black_box(&outputs);
    drop(outputs);

    #[cfg(feature = "memprof")]
    memprof::disable()?;

    Ok(())
}

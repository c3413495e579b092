//! A buffer allocated in one frame and grown in another ends up attributed to
//! the frame that grew it.

#[cfg_attr(feature = "memprof", memprof::measure)]
fn allocate() -> Vec<u8> {
    Vec::with_capacity(16)
}

#[cfg_attr(feature = "memprof", memprof::measure)]
fn extend(buf: &mut Vec<u8>) {
    buf.reserve_exact(4096);
    buf.extend(std::iter::repeat(1u8).take(4096));
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    #[cfg(feature = "memprof")]
    memprof::enable(memprof::Config::new().native(true))?;

    let mut buf = allocate();
    extend(&mut buf);

    #[cfg(feature = "memprof")]
    {
        let tree = memprof::dump_tree()?;
        println!("{}", serde_json::to_string_pretty(&tree)?);
    }

    std::hint::black_box(&buf);
    drop(buf);

    #[cfg(feature = "memprof")]
    memprof::disable()?;

    Ok(())
}

use std::collections::BTreeMap;

#[cfg_attr(feature = "memprof", memprof::measure)]
fn word_counts(text: &str) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for word in text.split_whitespace() {
        *counts.entry(word.to_lowercase()).or_insert(0) += 1;
    }
    counts
}

static TEXT: &str = "the quick brown fox jumps over the lazy dog the end";

fn main() {
    #[cfg(feature = "memprof")]
    let _memprof = {
        let dir = std::env::var_os("MEMPROF_OUTPUT_DIR")
            .map(std::path::PathBuf::from)
            .unwrap_or_else(std::env::temp_dir);

        memprof::MemprofBuilder::new("dump_on_drop::main")
            .native(true)
            .output_dir(dir)
            .format(memprof::Format::Json)
            .dump_on_drop(memprof::DumpFormat::Tree)
            .build()
    };

    let counts = word_counts(TEXT);
    // leaked on purpose so the counts are still live when the guard dumps
    let counts: &'static BTreeMap<String, usize> = Box::leak(Box::new(counts));
    println!("distinct words: {}", counts.len());
}

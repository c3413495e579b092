use std::collections::HashMap;
use std::io::{self, Write};
use std::mem;

use crate::frame::Frame;

/// Synthetic addresses for frame names. They only have to be unique.
#[derive(Default)]
struct Symbols<'a> {
    addrs: HashMap<&'a str, usize>,
}

impl<'a> Symbols<'a> {
    fn insert(&mut self, name: &'a str) -> Option<usize> {
        if self.addrs.contains_key(name) {
            return None;
        }
        let addr = (self.addrs.len() + 1) << 3;
        self.addrs.insert(name, addr);
        Some(addr)
    }

    fn get(&self, name: &str) -> io::Result<usize> {
        self.addrs
            .get(name)
            .copied()
            .ok_or_else(|| io::Error::other(format!("symbol address not found for {name}")))
    }
}

/// Writes the tree in pprof legacy heap format: a textual symbol section
/// followed by native-endian machine words.
///
/// Every frame with a non-zero self cost produces one sample: self bytes,
/// self blocks, stack depth, then one symbol address per frame from this one
/// up to (not including) the root.
pub(crate) fn write(root: &Frame, binary: &str, out: &mut dyn Write) -> io::Result<()> {
    let mut symbols = Symbols::default();

    writeln!(out, "--- symbol")?;
    writeln!(out, "binary={binary}")?;
    write_symbols(root, &mut symbols, out)?;
    writeln!(out, "---")?;
    writeln!(out, "--- profile")?;

    // header count, header words, format version, sampling period, padding
    for word in [0, 3, 0, 0, 0] {
        write_word(out, word)?;
    }

    write_frame(root, &symbols, out)
}

fn write_symbols<'a>(
    frame: &'a Frame,
    symbols: &mut Symbols<'a>,
    out: &mut dyn Write,
) -> io::Result<()> {
    if let Some(addr) = symbols.insert(frame.name()) {
        writeln!(
            out,
            "0x{:0width$x} {}",
            addr,
            frame.name(),
            width = mem::size_of::<usize>() * 2
        )?;
    }
    for child in frame.sorted_children() {
        write_symbols(child, symbols, out)?;
    }
    Ok(())
}

fn write_frame(frame: &Frame, symbols: &Symbols<'_>, out: &mut dyn Write) -> io::Result<()> {
    let cost = frame.self_cost();
    if cost.bytes > 0 {
        write_word(out, cost.bytes)?;
        write_word(out, cost.blocks)?;
        write_word(out, frame.stack_depth())?;
        for ancestor in frame.ancestors() {
            write_word(out, symbols.get(ancestor.name())?)?;
        }
    }
    for child in frame.sorted_children() {
        write_frame(child, symbols, out)?;
    }
    Ok(())
}

#[inline]
fn write_word(out: &mut dyn Write, word: usize) -> io::Result<()> {
    out.write_all(&word.to_ne_bytes())
}

#[cfg(test)]
mod tests {
    use crate::config::Config;
    use crate::session::Session;

    const WORD: usize = std::mem::size_of::<usize>();

    fn addr(n: usize) -> *mut u8 {
        (n * 0x10) as *mut u8
    }

    fn words(bytes: &[u8]) -> Vec<usize> {
        bytes
            .chunks_exact(WORD)
            .map(|c| usize::from_ne_bytes(c.try_into().unwrap()))
            .collect()
    }

    fn split(out: &[u8]) -> (String, Vec<usize>) {
        let marker = b"--- profile\n";
        let pos = out
            .windows(marker.len())
            .position(|w| w == marker)
            .unwrap();
        let text = String::from_utf8(out[..pos].to_vec()).unwrap();
        (text, words(&out[pos + marker.len()..]))
    }

    #[test]
    fn test_symbols_and_samples() {
        let mut session = Session::new(Config::new());
        let a = session.enter("a").unwrap();
        session.handle_alloc(100, || addr(1));
        let b = session.enter("b").unwrap();
        session.handle_alloc(7, || addr(2));
        session.handle_alloc(9, || addr(3));
        session.leave(b);
        session.leave(a);
        let c = session.enter("c").unwrap();
        session.leave(c);

        let mut out = Vec::new();
        super::write(session.root(), "app", &mut out).unwrap();
        let (text, words) = split(&out);

        let width = WORD * 2;
        assert_eq!(
            text,
            format!(
                "--- symbol\nbinary=app\n\
                 0x{:0width$x} root\n\
                 0x{:0width$x} a\n\
                 0x{:0width$x} b\n\
                 0x{:0width$x} c\n\
                 ---\n",
                8, 16, 24, 32
            )
        );

        assert_eq!(
            words,
            vec![
                0, 3, 0, 0, 0, // header
                100, 1, 1, 16, // a
                16, 2, 2, 24, 16, // b, then a
            ]
        );
    }

    #[test]
    fn test_repeated_names_share_a_symbol() {
        let mut session = Session::new(Config::new());
        let outer = session.enter("a").unwrap();
        let inner = session.enter("a").unwrap();
        session.handle_alloc(1, || addr(1));
        session.leave(inner);
        session.leave(outer);

        let mut out = Vec::new();
        super::write(session.root(), "app", &mut out).unwrap();
        let (text, words) = split(&out);

        assert_eq!(text.matches(" a\n").count(), 1);
        assert_eq!(&words[5..], &[1, 1, 2, 16, 16]);
    }

    #[test]
    fn test_empty_tree_has_header_only() {
        let session = Session::new(Config::new());
        let mut out = Vec::new();
        super::write(session.root(), "app", &mut out).unwrap();
        let (_, words) = split(&out);
        assert_eq!(words, vec![0, 3, 0, 0, 0]);
    }
}

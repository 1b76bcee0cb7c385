use std::fmt;
use std::num::NonZeroU32;

use fnv::FnvHashMap;
use smol_str::SmolStr;

/// An interned name. Symbols are never freed and compare by handle.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Symbol(NonZeroU32);

impl Symbol {
    const fn from_index(idx: u32) -> Symbol {
        match NonZeroU32::new(idx + 1) {
            Some(v) => Symbol(v),
            None => panic!("symbol index overflow"),
        }
    }

    fn index(self) -> usize {
        (self.0.get() - 1) as usize
    }

    /// Raw handle, stable for the lifetime of the table.
    pub fn id(self) -> u32 {
        self.0.get()
    }
}

impl fmt::Debug for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Symbol({})", self.0)
    }
}

macro_rules! predefined_symbols {
    ($($name:ident = $text:literal),* $(,)?) => {
        /// Symbols every table starts with.
        pub mod sym {
            use super::Symbol;

            predefined_symbols!(@consts 0u32; $($name)*);

            pub(super) const NAMES: &[&str] = &[$($text),*];
        }
    };
    (@consts $n:expr; $head:ident $($rest:ident)*) => {
        pub const $head: Symbol = Symbol::from_index($n);
        predefined_symbols!(@consts $n + 1u32; $($rest)*);
    };
    (@consts $n:expr;) => {};
}

predefined_symbols! {
    INITIALIZE = "initialize",
    METHOD_MISSING = "method_missing",
    CALL = "call",
    NEW = "new",
    TO_S = "to_s",
    INSPECT = "inspect",
    MESSAGE = "message",
    EXCEPTION = "exception",
    EACH = "each",
    OP_EQ = "==",
    OP_AREF = "[]",
    OP_ASET = "[]=",
    OP_ADD = "+",
    OP_SUB = "-",
    OP_MUL = "*",
    OP_DIV = "/",
    OP_LT = "<",
    OP_LE = "<=",
    OP_GT = ">",
    OP_GE = ">=",
    RESUME = "resume",
    YIELD = "yield",
}

/// Names are keyed by their raw bytes, so two byte strings that only differ
/// in invalid UTF-8 still get distinct symbols.
#[derive(Debug)]
pub struct SymbolTable {
    by_bytes: FnvHashMap<Box<[u8]>, Symbol>,
    names: Vec<Entry>,
}

#[derive(Debug)]
struct Entry {
    bytes: Box<[u8]>,
    /// Lossy UTF-8 rendering for messages and `inspect`
    display: SmolStr,
}

impl SymbolTable {
    pub fn new() -> Self {
        let mut table = SymbolTable {
            by_bytes: FnvHashMap::default(),
            names: Vec::with_capacity(sym::NAMES.len()),
        };
        for name in sym::NAMES {
            table.intern(name);
        }
        table
    }

    pub fn intern(&mut self, name: &str) -> Symbol {
        self.intern_bytes(name.as_bytes())
    }

    pub fn intern_bytes(&mut self, name: &[u8]) -> Symbol {
        if let Some(&s) = self.by_bytes.get(name) {
            return s;
        }
        let s = Symbol::from_index(self.names.len() as u32);
        let bytes: Box<[u8]> = name.into();
        self.names.push(Entry {
            bytes: bytes.clone(),
            display: SmolStr::new(String::from_utf8_lossy(name)),
        });
        self.by_bytes.insert(bytes, s);
        s
    }

    pub fn lookup(&self, name: &str) -> Option<Symbol> {
        self.by_bytes.get(name.as_bytes()).copied()
    }

    pub fn name(&self, s: Symbol) -> &str {
        &self.names[s.index()].display
    }

    pub fn bytes(&self, s: Symbol) -> &[u8] {
        &self.names[s.index()].bytes
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

impl Default for SymbolTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;
    use test_env_log::test;

    use super::*;

    #[test]
    fn interning_is_idempotent() {
        let mut t = SymbolTable::new();
        let a = t.intern("foo");
        let b = t.intern("foo");
        let c = t.intern("bar");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(t.name(a), "foo");
        assert_eq!(t.name(c), "bar");
        assert_eq!(t.lookup("baz"), None);
    }

    #[test]
    fn predefined_symbols_are_stable() {
        let mut t = SymbolTable::new();
        assert_eq!(t.intern("initialize"), sym::INITIALIZE);
        assert_eq!(t.intern("[]="), sym::OP_ASET);
        assert_eq!(t.name(sym::YIELD), "yield");
    }

    #[test]
    fn invalid_utf8_names_stay_distinct() {
        let mut t = SymbolTable::new();
        let a = t.intern_bytes(b"a\xff");
        let b = t.intern_bytes(b"a\xfe");
        assert_ne!(a, b);
        assert_eq!(t.intern_bytes(b"a\xff"), a);
        assert_eq!(t.bytes(b), b"a\xfe");
        // both render the same way, the handles still differ
        assert_eq!(t.name(a), t.name(b));
        assert_eq!(t.intern_bytes(b"foo"), t.intern("foo"));
    }

    #[test]
    fn distinct_names_never_collide() {
        let mut t = SymbolTable::new();
        let mut rng = fastrand::Rng::with_seed(7);
        let mut seen = FnvHashMap::default();
        for _ in 0..2000 {
            let len = rng.usize(1..6);
            let name: String = (0..len).map(|_| rng.alphanumeric()).collect();
            let s = t.intern(&name);
            if let Some(prev) = seen.insert(s, name.clone()) {
                assert_eq!(prev, name);
            }
        }
    }
}

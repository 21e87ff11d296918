//! Cheap shared strings. `Strng` is reference counted, so clones are pointer
//! copies and literals allocate nothing.

pub use arcstr::{ArcStr, format, literal};

pub type Strng = ArcStr;

pub fn new<A: AsRef<str>>(s: A) -> Strng {
	ArcStr::from(s.as_ref())
}

pub const EMPTY: Strng = literal!("");

// Copyright (c) 2017-2021 Fabian Schuiki

//! Various utility functions that fit nowhere else.

use std::fmt;

/// Formats a sequence of elements that implement the `std::fmt::Display` trait
/// as a list with the given separator.
pub fn write_implode<T, I, S>(f: &mut fmt::Formatter, sep: S, it: I) -> fmt::Result
where
    T: fmt::Display,
    I: Iterator<Item = T>,
    S: fmt::Display,
{
    write_implode_with(f, sep, it, |f, x| x.fmt(f))
}

/// Formats a set of blocks or addresses as `{a, b, c}`.
pub fn write_set<'a, T, I>(f: &mut fmt::Formatter, set: I) -> fmt::Result
where
    T: fmt::Display + 'a,
    I: IntoIterator<Item = &'a T>,
{
    write!(f, "{{")?;
    write_implode(f, ", ", set.into_iter())?;
    write!(f, "}}")
}

/// Formats a sequence of elements using a callback function, inserting the
/// given separator between consecutive elements.
pub fn write_implode_with<T, I, S, F>(
    f: &mut fmt::Formatter,
    sep: S,
    mut it: I,
    write: F,
) -> fmt::Result
where
    I: Iterator<Item = T>,
    S: fmt::Display,
    F: Fn(&mut fmt::Formatter, T) -> fmt::Result,
{
    if let Some(x) = it.next() {
        write(f, x)?;
    }
    for x in it {
        write!(f, "{}", sep)?;
        write(f, x)?;
    }
    Ok(())
}

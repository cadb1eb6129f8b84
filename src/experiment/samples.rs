//! Attribution of program-counter samples to functions, statements and
//! linked objects.
//!
//! A sample taken at `pc` in thread `t` at time `time` belongs to the address
//! space of `t` that was mapped at `time` and contains `pc`. Symbol ranges are
//! stored relative to their linked object's load address.

use std::path::PathBuf;
use std::str::FromStr;

use rusqlite::{params, Connection, OptionalExtension};
use rustc_hash::FxHashMap;

use super::store::{decode, ExperimentStore};
use crate::result::{FunctionRef, LinkedObjectRef, ResultValue, SourceLocation, StatementRef};
use crate::{Error, Result};

const NANOS_PER_SECOND: f64 = 1e9;

/// What a report row aggregates over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Granularity {
    /// One row per function.
    #[default]
    Functions,
    /// One row per source statement.
    Statements,
    /// One row per executable or library.
    LinkedObjects,
}

impl Granularity {
    /// Heading of the key column.
    #[must_use]
    pub const fn key_title(self) -> &'static str {
        match self {
            Self::Functions => "Function (defining location)",
            Self::Statements => "Statement Location (Line Number)",
            Self::LinkedObjects => "LinkedObject",
        }
    }
}

impl FromStr for Granularity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "function" | "functions" => Ok(Self::Functions),
            "statement" | "statements" => Ok(Self::Statements),
            "linkedobject" | "linkedobjects" => Ok(Self::LinkedObjects),
            other => Err(Error::InvalidOperand(format!(
                "unknown view granularity '{other}'"
            ))),
        }
    }
}

/// Samples of one key in one thread.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleBucket {
    /// Row key (function, statement or linked object cell).
    pub key: ResultValue,
    /// Store id of the monitored thread.
    pub thread: i64,
    /// Sampled time in seconds.
    pub seconds: f64,
    /// Number of samples.
    pub samples: u64,
}

struct Space {
    thread: i64,
    time_begin: u64,
    time_end: u64,
    addr_begin: u64,
    addr_end: u64,
    linked_object: i64,
}

struct SymbolRange {
    begin: u64,
    end: u64,
    bitmap: Vec<u8>,
    target: i64,
}

/// True when `index` is marked valid in `bitmap`. An empty bitmap marks the
/// whole range valid.
#[must_use]
pub fn bitmap_allows(bitmap: &[u8], index: u64) -> bool {
    if bitmap.is_empty() {
        return true;
    }
    usize::try_from(index / 8)
        .ok()
        .and_then(|byte| bitmap.get(byte))
        .is_some_and(|byte| byte & (1 << (index % 8)) != 0)
}

impl ExperimentStore {
    /// Aggregate the samples of `collector` per key and per thread.
    ///
    /// Samples that fall outside every known address space or symbol range
    /// are not reported.
    ///
    /// # Errors
    ///
    /// Returns an error if a store query fails.
    pub fn sample_buckets(
        &self,
        collector: &str,
        granularity: Granularity,
    ) -> Result<Vec<SampleBucket>> {
        let connection = self.connect()?;
        let spaces = load_spaces(&connection)?;
        let ranges = match granularity {
            Granularity::Functions => load_ranges(
                &connection,
                "SELECT r.function, f.linked_object, r.addr_begin, r.addr_end, r.valid_bitmap
                 FROM FunctionRanges r JOIN Functions f ON r.function = f.id",
            )?,
            Granularity::Statements => load_ranges(
                &connection,
                "SELECT r.statement, s.linked_object, r.addr_begin, r.addr_end, r.valid_bitmap
                 FROM StatementRanges r JOIN Statements s ON r.statement = s.id",
            )?,
            Granularity::LinkedObjects => FxHashMap::default(),
        };

        let mut totals: FxHashMap<(i64, i64), (f64, u64)> = FxHashMap::default();
        let mut statement = connection.prepare(
            "SELECT d.thread, d.time_begin, d.interval, s.pc, s.count
             FROM Data d JOIN DataSamples s ON s.data = d.id
             WHERE d.collector = ?1",
        )?;
        let mut rows = statement.query(params![collector])?;
        while let Some(row) = rows.next()? {
            let thread: i64 = row.get(0)?;
            let time = decode(row.get(1)?);
            let interval = decode(row.get(2)?);
            let pc = decode(row.get(3)?);
            let count = decode(row.get(4)?);

            let Some(space) = spaces.iter().find(|s| {
                s.thread == thread
                    && s.time_begin <= time
                    && time < s.time_end
                    && s.addr_begin <= pc
                    && pc < s.addr_end
            }) else {
                continue;
            };
            let offset = pc - space.addr_begin;
            let target = match granularity {
                Granularity::LinkedObjects => Some(space.linked_object),
                _ => ranges.get(&space.linked_object).and_then(|candidates| {
                    candidates
                        .iter()
                        .find(|r| {
                            r.begin <= offset
                                && offset < r.end
                                && bitmap_allows(&r.bitmap, offset - r.begin)
                        })
                        .map(|r| r.target)
                }),
            };
            let Some(target) = target else { continue };

            #[allow(clippy::cast_precision_loss)]
            let seconds = count as f64 * interval as f64 / NANOS_PER_SECOND;
            let entry = totals.entry((target, thread)).or_insert((0.0, 0));
            entry.0 += seconds;
            entry.1 += count;
        }
        drop(rows);

        let mut keys: FxHashMap<i64, ResultValue> = FxHashMap::default();
        let mut buckets = Vec::with_capacity(totals.len());
        for ((target, thread), (seconds, samples)) in totals {
            let key = match keys.get(&target) {
                Some(key) => key.clone(),
                None => {
                    let key = resolve_key(&connection, granularity, target)?;
                    keys.insert(target, key.clone());
                    key
                }
            };
            buckets.push(SampleBucket {
                key,
                thread,
                seconds,
                samples,
            });
        }
        Ok(buckets)
    }
}

fn load_spaces(connection: &Connection) -> Result<Vec<Space>> {
    let mut statement = connection.prepare(
        "SELECT thread, time_begin, time_end, addr_begin, addr_end, linked_object
         FROM AddressSpaces",
    )?;
    let rows = statement.query_map(params![], |row| {
        Ok(Space {
            thread: row.get(0)?,
            time_begin: decode(row.get(1)?),
            time_end: decode(row.get(2)?),
            addr_begin: decode(row.get(3)?),
            addr_end: decode(row.get(4)?),
            linked_object: row.get(5)?,
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

fn load_ranges(connection: &Connection, sql: &str) -> Result<FxHashMap<i64, Vec<SymbolRange>>> {
    let mut by_object: FxHashMap<i64, Vec<SymbolRange>> = FxHashMap::default();
    let mut statement = connection.prepare(sql)?;
    let mut rows = statement.query(params![])?;
    while let Some(row) = rows.next()? {
        let range = SymbolRange {
            target: row.get(0)?,
            begin: decode(row.get(2)?),
            end: decode(row.get(3)?),
            bitmap: row.get(4)?,
        };
        by_object.entry(row.get(1)?).or_default().push(range);
    }
    Ok(by_object)
}

fn resolve_key(connection: &Connection, granularity: Granularity, id: i64) -> Result<ResultValue> {
    let key = match granularity {
        Granularity::Functions => {
            let (name, object, lowest): (String, String, i64) = connection.query_row(
                "SELECT f.name, p.path, MIN(r.addr_begin)
                 FROM Functions f
                 JOIN LinkedObjects l ON f.linked_object = l.id
                 JOIN Files p ON l.file = p.id
                 LEFT JOIN FunctionRanges r ON r.function = f.id
                 WHERE f.id = ?1",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get::<_, Option<i64>>(2)?.unwrap_or(0))),
            )?;
            let definition: Option<(String, u32)> = connection
                .query_row(
                    "SELECT p.path, s.line
                     FROM Statements s
                     JOIN StatementRanges r ON r.statement = s.id
                     JOIN Files p ON s.file = p.id
                     JOIN Functions f ON f.linked_object = s.linked_object
                     WHERE f.id = ?1 AND r.addr_begin <= ?2 AND ?2 < r.addr_end
                     ORDER BY s.line LIMIT 1",
                    params![id, lowest],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            let function = FunctionRef::new(name, PathBuf::from(object));
            ResultValue::FunctionRef(match definition {
                Some((path, line)) => function.with_definition(SourceLocation::new(path, line)),
                None => function,
            })
        }
        Granularity::Statements => connection.query_row(
            "SELECT p.path, s.line, s.\"column\"
             FROM Statements s JOIN Files p ON s.file = p.id
             WHERE s.id = ?1",
            params![id],
            |row| {
                Ok(ResultValue::StatementRef(StatementRef::new(
                    PathBuf::from(row.get::<_, String>(0)?),
                    row.get(1)?,
                    row.get(2)?,
                )))
            },
        )?,
        Granularity::LinkedObjects => connection.query_row(
            "SELECT p.path FROM LinkedObjects l JOIN Files p ON l.file = p.id WHERE l.id = ?1",
            params![id],
            |row| {
                Ok(ResultValue::LinkedObjectRef(LinkedObjectRef::new(
                    PathBuf::from(row.get::<_, String>(0)?),
                )))
            },
        )?,
    };
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bitmap_allows() {
        assert!(bitmap_allows(&[], 12_345));
        assert!(bitmap_allows(&[0b0000_0101], 0));
        assert!(!bitmap_allows(&[0b0000_0101], 1));
        assert!(bitmap_allows(&[0b0000_0101], 2));
        assert!(!bitmap_allows(&[0xff], 8));
    }

    #[test]
    fn test_granularity_parse() {
        assert_eq!("Statements".parse::<Granularity>().unwrap(), Granularity::Statements);
        assert_eq!(
            "linkedobjects".parse::<Granularity>().unwrap(),
            Granularity::LinkedObjects
        );
        assert!("loops".parse::<Granularity>().is_err());
    }
}

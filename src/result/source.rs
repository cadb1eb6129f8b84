//! Source-location report cells: functions, statements, linked objects.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// A file and line, e.g. the definition site of a function.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SourceLocation {
    /// Source file
    pub path: PathBuf,
    /// 1-based line number
    pub line: u32,
}

impl SourceLocation {
    /// Create a location.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, line: u32) -> Self {
        Self {
            path: path.into(),
            line,
        }
    }
}

/// A function in some linked object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FunctionRef {
    name: String,
    linked_object: PathBuf,
    definitions: Vec<SourceLocation>,
}

impl FunctionRef {
    /// Create a function reference with no known definition site.
    #[must_use]
    pub fn new(name: impl Into<String>, linked_object: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            linked_object: linked_object.into(),
            definitions: Vec::new(),
        }
    }

    /// Add a definition site. Sites are kept sorted and unique.
    #[must_use]
    pub fn with_definition(mut self, definition: SourceLocation) -> Self {
        if let Err(at) = self.definitions.binary_search(&definition) {
            self.definitions.insert(at, definition);
        }
        self
    }

    /// Demangled function name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Path of the containing executable or library.
    #[must_use]
    pub fn linked_object(&self) -> &Path {
        &self.linked_object
    }

    /// Known definition sites.
    #[must_use]
    pub fn definitions(&self) -> &[SourceLocation] {
        &self.definitions
    }

    /// `name(object: file,line)`, with `  &...` when there is more than one
    /// definition site.
    #[must_use]
    pub fn form(&self, full_path: bool) -> String {
        let mut text = format!(
            "{}({}",
            self.name,
            display_path(&self.linked_object, full_path)
        );
        if let Some(first) = self.definitions.first() {
            text.push_str(": ");
            text.push_str(&display_path(&first.path, full_path));
            text.push(',');
            text.push_str(&first.line.to_string());
            if self.definitions.len() > 1 {
                text.push_str("  &...");
            }
        }
        text.push(')');
        text
    }
}

/// A source statement (file + line).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StatementRef {
    path: PathBuf,
    line: u32,
    column: Option<u32>,
}

impl StatementRef {
    /// Create a statement reference.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, line: u32, column: Option<u32>) -> Self {
        Self {
            path: path.into(),
            line,
            column,
        }
    }

    /// Source file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Line number.
    #[must_use]
    pub const fn line(&self) -> u32 {
        self.line
    }

    /// Column, when the symbol table recorded one.
    #[must_use]
    pub const fn column(&self) -> Option<u32> {
        self.column
    }

    /// `line file`
    #[must_use]
    pub fn form(&self, full_path: bool) -> String {
        format!("{} {}", self.line, display_path(&self.path, full_path))
    }
}

/// An executable or shared library.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LinkedObjectRef {
    path: PathBuf,
}

impl LinkedObjectRef {
    /// Create a linked object reference.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the object.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Basename, or the whole path when `full_path` is set.
    #[must_use]
    pub fn form(&self, full_path: bool) -> String {
        display_path(&self.path, full_path)
    }
}

fn display_path(path: &Path, full_path: bool) -> String {
    if full_path {
        return path.display().to_string();
    }
    path.file_name().map_or_else(
        || path.display().to_string(),
        |name| name.to_string_lossy().into_owned(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_function_form_without_definition() {
        let f = FunctionRef::new("main", "/usr/bin/stress");
        assert_eq!(f.form(false), "main(stress)");
        assert_eq!(f.form(true), "main(/usr/bin/stress)");
    }

    #[test]
    fn test_function_form_with_definitions() {
        let f = FunctionRef::new("work", "/opt/app/libwork.so")
            .with_definition(SourceLocation::new("/src/work.c", 42));
        assert_eq!(f.form(false), "work(libwork.so: work.c,42)");

        let f = f.with_definition(SourceLocation::new("/src/work.c", 90));
        assert_eq!(f.form(false), "work(libwork.so: work.c,42  &...)");
    }

    #[test]
    fn test_definitions_deduplicated() {
        let site = SourceLocation::new("a.c", 1);
        let f = FunctionRef::new("f", "a.out")
            .with_definition(site.clone())
            .with_definition(site);
        assert_eq!(f.definitions().len(), 1);
    }

    #[test]
    fn test_statement_form() {
        let s = StatementRef::new("/src/loop.c", 17, Some(3));
        assert_eq!(s.form(false), "17 loop.c");
        assert_eq!(s.form(true), "17 /src/loop.c");
    }

    #[test]
    fn test_linked_object_form() {
        let lo = LinkedObjectRef::new("/lib64/libc.so.6");
        assert_eq!(lo.form(false), "libc.so.6");
    }
}

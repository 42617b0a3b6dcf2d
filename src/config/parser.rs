// src/config/parser.rs

//! Hand-written recursive-descent parser for the recipe DSL.
//!
//! The grammar is small: recipe definitions `<namespace>/<name> { ... }`
//! whose fields are scalars, dependency lists, or brace-balanced code
//! blocks, plus `@import` directives. Whitespace only separates; `//` and
//! `/* */` comments are skipped between tokens. There is no error recovery:
//! the first violation aborts with a `file:line:column` message.

use crate::error::{Error, Result};
use crate::recipe::{
    BuildSpec, Dependency, ImageDependency, Namespace, Payload, Recipe, SourceKind, SourceRef,
    SourceSpec, Status,
};

/// One parsed file: its recipes plus the unresolved `@import` paths in
/// order of appearance.
#[derive(Debug)]
pub struct ParsedFile {
    pub recipes: Vec<Recipe>,
    pub imports: Vec<String>,
}

pub fn parse_str(file: &str, input: &str) -> Result<ParsedFile> {
    let mut cursor = Cursor::new(file, input);
    let mut recipes = Vec::new();
    let mut imports = Vec::new();

    loop {
        cursor.skip_trivia()?;
        if cursor.eof() {
            break;
        }

        if cursor.match_char('@') {
            let directive = cursor.parse_identifier()?;
            if directive != "import" {
                return Err(cursor.error(&format!("unknown directive `@{}`", directive)));
            }
            cursor.skip_trivia()?;
            imports.push(cursor.parse_scalar()?);
        } else {
            recipes.push(parse_recipe(&mut cursor)?);
        }
    }

    Ok(ParsedFile { recipes, imports })
}

fn parse_recipe(cursor: &mut Cursor) -> Result<Recipe> {
    let namespace_word = cursor.parse_identifier()?;
    let namespace = Namespace::parse(&namespace_word)
        .ok_or_else(|| cursor.error(&format!("invalid namespace `{}`", namespace_word)))?;
    cursor.expect_char('/')?;
    let name = cursor.parse_identifier()?;
    cursor.skip_trivia()?;
    cursor.expect_char('{')?;

    let mut fields = Fields::default();
    loop {
        cursor.skip_trivia()?;
        if cursor.match_char('}') {
            break;
        }
        if cursor.eof() {
            return Err(cursor.error(&format!("unterminated definition of `{}/{}`", namespace, name)));
        }

        let key = cursor.parse_identifier()?;
        cursor.skip_trivia()?;
        cursor.match_char(':');
        cursor.skip_trivia()?;
        parse_field(cursor, namespace, &key, &mut fields)?;

        cursor.skip_trivia()?;
        cursor.match_char(',');
    }

    build_recipe(cursor, namespace, name, fields)
}

/// Field values accumulated while a definition body is parsed.
#[derive(Default)]
struct Fields {
    url: Option<String>,
    kind: Option<String>,
    b2sum: Option<String>,
    commit: Option<String>,
    patch: Option<String>,
    strap: Option<String>,
    source: Option<String>,
    configure: Option<String>,
    build: Option<String>,
    install: Option<String>,
    dependencies: Vec<Dependency>,
    image_dependencies: Vec<ImageDependency>,
    has_dependencies: bool,
}

fn parse_field(cursor: &mut Cursor, namespace: Namespace, key: &str, fields: &mut Fields) -> Result<()> {
    let slot = match (namespace, key) {
        (Namespace::Source, "url") => Some(&mut fields.url),
        (Namespace::Source, "type") => Some(&mut fields.kind),
        (Namespace::Source, "b2sum") => Some(&mut fields.b2sum),
        (Namespace::Source, "commit") => Some(&mut fields.commit),
        (Namespace::Source, "patch") => Some(&mut fields.patch),
        (Namespace::Host | Namespace::Target, "source") => Some(&mut fields.source),
        _ => None,
    };
    if let Some(slot) = slot {
        if slot.is_some() {
            return Err(cursor.error(&format!("field `{}` defined twice", key)));
        }
        *slot = Some(cursor.parse_scalar()?);
        return Ok(());
    }

    let block = match (namespace, key) {
        (Namespace::Source, "strap") => Some(&mut fields.strap),
        (Namespace::Host | Namespace::Target, "configure") => Some(&mut fields.configure),
        (Namespace::Host | Namespace::Target, "build") => Some(&mut fields.build),
        (Namespace::Host | Namespace::Target, "install") => Some(&mut fields.install),
        _ => None,
    };
    if let Some(block) = block {
        if block.is_some() {
            return Err(cursor.error(&format!("field `{}` defined twice", key)));
        }
        *block = Some(cursor.parse_block()?);
        return Ok(());
    }

    if key == "dependencies" {
        if fields.has_dependencies {
            return Err(cursor.error("field `dependencies` defined twice"));
        }
        fields.has_dependencies = true;
        parse_dependencies(cursor, fields)?;
        return Ok(());
    }

    Err(cursor.error(&format!("unknown field `{}` in {} recipe", key, namespace)))
}

fn parse_dependencies(cursor: &mut Cursor, fields: &mut Fields) -> Result<()> {
    cursor.expect_char('[')?;
    loop {
        cursor.skip_trivia()?;
        if cursor.match_char(',') {
            continue;
        }
        if cursor.match_char(']') {
            break;
        }
        if cursor.eof() {
            return Err(cursor.error("unterminated dependency list"));
        }

        let runtime = cursor.match_char('*');
        let namespace_word = cursor.parse_identifier()?;
        cursor.expect_char('/')?;
        let name = cursor.parse_identifier()?;

        if namespace_word == "image" {
            fields.image_dependencies.push(ImageDependency { name, runtime });
        } else {
            let namespace = Namespace::parse(&namespace_word).ok_or_else(|| {
                cursor.error(&format!("invalid namespace `{}` in dependency", namespace_word))
            })?;
            fields.dependencies.push(Dependency {
                namespace,
                name,
                runtime,
                resolved: None,
            });
        }
    }
    Ok(())
}

fn build_recipe(cursor: &Cursor, namespace: Namespace, name: String, fields: Fields) -> Result<Recipe> {
    let payload = match namespace {
        Namespace::Source => {
            let url = fields
                .url
                .ok_or_else(|| cursor.error(&format!("missing url in `source/{}`", name)))?;
            let kind_word = fields
                .kind
                .ok_or_else(|| cursor.error(&format!("missing type in `source/{}`", name)))?;

            let is_tar = matches!(kind_word.as_str(), "tar.gz" | "tar.xz");
            if is_tar && fields.b2sum.is_none() {
                return Err(cursor.error(&format!("missing b2sum in `source/{}`", name)));
            }
            if !is_tar && fields.b2sum.is_some() {
                return Err(cursor.error(&format!("unexpected b2sum in `source/{}`", name)));
            }
            if kind_word == "git" && fields.commit.is_none() {
                return Err(cursor.error(&format!("missing commit in `source/{}`", name)));
            }
            if kind_word != "git" && fields.commit.is_some() {
                return Err(cursor.error(&format!("unexpected commit in `source/{}`", name)));
            }

            let kind = match kind_word.as_str() {
                "tar.gz" => SourceKind::TarGz {
                    b2sum: fields.b2sum.unwrap_or_default(),
                },
                "tar.xz" => SourceKind::TarXz {
                    b2sum: fields.b2sum.unwrap_or_default(),
                },
                "git" => SourceKind::Git {
                    commit: fields.commit.unwrap_or_default(),
                },
                "local" => SourceKind::Local,
                other => {
                    return Err(cursor.error(&format!("invalid source type `{}`", other)));
                }
            };

            Payload::Source(SourceSpec {
                url,
                kind,
                patch: fields.patch,
                strap: fields.strap,
            })
        }
        Namespace::Host | Namespace::Target => {
            let spec = BuildSpec {
                source: fields.source.map(|name| SourceRef { name, resolved: None }),
                configure: fields.configure,
                build: fields.build,
                install: fields.install,
            };
            match namespace {
                Namespace::Host => Payload::Host(spec),
                _ => Payload::Target(spec),
            }
        }
    };

    Ok(Recipe {
        name,
        payload,
        dependencies: fields.dependencies,
        image_dependencies: fields.image_dependencies,
        status: Status::default(),
    })
}

struct Cursor<'a> {
    file: &'a str,
    input: Vec<char>,
    pos: usize,
    line: usize,
    col: usize,
}

impl<'a> Cursor<'a> {
    fn new(file: &'a str, input: &str) -> Cursor<'a> {
        Cursor {
            file,
            input: input.chars().collect(),
            pos: 0,
            line: 1,
            col: 1,
        }
    }

    fn error(&self, message: &str) -> Error {
        Error::ParseError(format!("{}:{}:{}: {}", self.file, self.line, self.col, message))
    }

    fn eof(&self) -> bool {
        self.pos >= self.input.len()
    }

    fn peek(&self) -> Option<char> {
        self.input.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.input.get(self.pos + offset).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let ch = self.peek()?;
        self.pos += 1;
        if ch == '\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        Some(ch)
    }

    fn match_char(&mut self, expected: char) -> bool {
        if self.peek() == Some(expected) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn expect_char(&mut self, expected: char) -> Result<()> {
        if self.match_char(expected) {
            Ok(())
        } else {
            Err(self.error(&format!("expected `{}`", expected)))
        }
    }

    /// Skip whitespace and both comment forms.
    fn skip_trivia(&mut self) -> Result<()> {
        loop {
            match self.peek() {
                Some(ch) if ch.is_whitespace() => {
                    self.bump();
                }
                Some('/') if self.peek_at(1) == Some('/') => {
                    while let Some(ch) = self.bump() {
                        if ch == '\n' {
                            break;
                        }
                    }
                }
                Some('/') if self.peek_at(1) == Some('*') => {
                    self.bump();
                    self.bump();
                    loop {
                        match self.bump() {
                            Some('*') if self.peek() == Some('/') => {
                                self.bump();
                                break;
                            }
                            Some(_) => {}
                            None => return Err(self.error("unterminated block comment")),
                        }
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    /// ASCII letter, then letters/digits/`_`/`.`/`-`/`+`.
    fn parse_identifier(&mut self) -> Result<String> {
        match self.peek() {
            Some(ch) if ch.is_ascii_alphabetic() => {}
            _ => return Err(self.error("expected identifier")),
        }

        let mut out = String::new();
        while let Some(ch) = self.peek() {
            if ch.is_ascii_alphanumeric() || matches!(ch, '_' | '.' | '-' | '+') {
                out.push(ch);
                self.bump();
            } else {
                break;
            }
        }
        Ok(out)
    }

    /// A scalar value: a double-quoted string (no newline inside) or a bare
    /// run of characters ending at whitespace, `,`, or `}`.
    fn parse_scalar(&mut self) -> Result<String> {
        if self.match_char('"') {
            let mut out = String::new();
            loop {
                match self.bump() {
                    Some('"') => return Ok(out),
                    Some('\n') | None => return Err(self.error("string does not terminate")),
                    Some(ch) => out.push(ch),
                }
            }
        }

        let mut out = String::new();
        while let Some(ch) = self.peek() {
            if ch.is_whitespace() || ch == ',' || ch == '}' {
                break;
            }
            out.push(ch);
            self.bump();
        }
        if out.is_empty() {
            return Err(self.error("expected a value"));
        }
        Ok(out)
    }

    /// `{` ... balanced `}`; the body is opaque text, trimmed at both ends.
    fn parse_block(&mut self) -> Result<String> {
        self.expect_char('{')?;
        let mut depth = 0usize;
        let mut out = String::new();
        loop {
            match self.bump() {
                Some('{') => {
                    depth += 1;
                    out.push('{');
                }
                Some('}') => {
                    if depth == 0 {
                        return Ok(out.trim().to_string());
                    }
                    depth -= 1;
                    out.push('}');
                }
                Some(ch) => out.push(ch),
                None => return Err(self.error("unterminated code block")),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(input: &str) -> Result<ParsedFile> {
        parse_str("test.chariot", input)
    }

    #[test]
    fn test_parse_local_source() {
        let parsed = parse("source/foo { type: local, url: \"fx\" }").unwrap();
        assert_eq!(parsed.recipes.len(), 1);
        let recipe = &parsed.recipes[0];
        assert_eq!(recipe.name, "foo");
        let spec = recipe.source_spec().unwrap();
        assert_eq!(spec.url, "fx");
        assert_eq!(spec.kind, SourceKind::Local);
    }

    #[test]
    fn test_parse_tar_source() {
        let parsed = parse(
            "source/binutils {\n\
             \ttype: tar.xz\n\
             \turl: https://ftp.gnu.org/gnu/binutils/binutils-2.43.tar.xz\n\
             \tb2sum: aaaabbbb\n\
             }",
        )
        .unwrap();
        let spec = parsed.recipes[0].source_spec().unwrap();
        assert!(matches!(&spec.kind, SourceKind::TarXz { b2sum } if b2sum == "aaaabbbb"));
        assert!(spec.url.starts_with("https://"));
    }

    #[test]
    fn test_parse_git_source_with_strap() {
        let parsed = parse(
            "source/limine {\n\
             \ttype: git\n\
             \turl: https://github.com/limine-bootloader/limine.git\n\
             \tcommit: 7e03f05\n\
             \tstrap { ./bootstrap }\n\
             }",
        )
        .unwrap();
        let spec = parsed.recipes[0].source_spec().unwrap();
        assert!(matches!(&spec.kind, SourceKind::Git { commit } if commit == "7e03f05"));
        assert_eq!(spec.strap.as_deref(), Some("./bootstrap"));
    }

    #[test]
    fn test_parse_host_recipe_with_everything() {
        let parsed = parse(
            "host/gcc {\n\
             \tsource: gcc\n\
             \tdependencies: [ host/binutils *target/mlibc image/gcc, *image/nasm ]\n\
             \tconfigure: { @(source_dir)/configure --prefix=@(prefix) }\n\
             \tbuild { make -j@(thread_count) }\n\
             \tinstall { make DESTDIR=@(install_dir) install }\n\
             }",
        )
        .unwrap();
        let recipe = &parsed.recipes[0];
        assert_eq!(recipe.namespace(), Namespace::Host);
        let spec = recipe.build_spec().unwrap();
        assert_eq!(spec.source.as_ref().unwrap().name, "gcc");
        assert!(spec.configure.as_deref().unwrap().contains("--prefix=@(prefix)"));

        assert_eq!(recipe.dependencies.len(), 2);
        assert!(!recipe.dependencies[0].runtime);
        assert_eq!(recipe.dependencies[0].namespace, Namespace::Host);
        assert!(recipe.dependencies[1].runtime);
        assert_eq!(recipe.dependencies[1].namespace, Namespace::Target);

        assert_eq!(recipe.image_dependencies.len(), 2);
        assert!(!recipe.image_dependencies[0].runtime);
        assert!(recipe.image_dependencies[1].runtime);
    }

    #[test]
    fn test_parse_comments() {
        let parsed = parse(
            "// leading comment\n\
             /* block\n comment */\n\
             target/pkg { build { make } } // trailing",
        )
        .unwrap();
        assert_eq!(parsed.recipes.len(), 1);
    }

    #[test]
    fn test_parse_nested_block() {
        let parsed = parse("target/pkg { build { if true; then { echo a; } fi } }").unwrap();
        let spec = parsed.recipes[0].build_spec().unwrap();
        assert_eq!(spec.build.as_deref(), Some("if true; then { echo a; } fi"));
    }

    #[test]
    fn test_parse_import_directive() {
        let parsed = parse("@import recipes/base.chariot\nsource/x { type: local, url: u }").unwrap();
        assert_eq!(parsed.imports, vec!["recipes/base.chariot"]);
        assert_eq!(parsed.recipes.len(), 1);
    }

    #[test]
    fn test_parse_quoted_import() {
        let parsed = parse("@import \"recipes/base.chariot\"").unwrap();
        assert_eq!(parsed.imports, vec!["recipes/base.chariot"]);
    }

    #[test]
    fn test_missing_b2sum_rejected() {
        let err = parse("source/x { type: tar.gz, url: u }").unwrap_err();
        assert!(matches!(err, Error::ParseError(msg) if msg.contains("missing b2sum")));
    }

    #[test]
    fn test_unexpected_b2sum_rejected() {
        let err = parse("source/x { type: local, url: u, b2sum: ff }").unwrap_err();
        assert!(matches!(err, Error::ParseError(msg) if msg.contains("unexpected b2sum")));
    }

    #[test]
    fn test_missing_commit_rejected() {
        let err = parse("source/x { type: git, url: u }").unwrap_err();
        assert!(matches!(err, Error::ParseError(msg) if msg.contains("missing commit")));
    }

    #[test]
    fn test_unexpected_commit_rejected() {
        let err = parse("source/x { type: local, url: u, commit: abc }").unwrap_err();
        assert!(matches!(err, Error::ParseError(msg) if msg.contains("unexpected commit")));
    }

    #[test]
    fn test_unknown_field_rejected() {
        let err = parse("target/x { flavour: mild }").unwrap_err();
        assert!(matches!(err, Error::ParseError(msg) if msg.contains("unknown field `flavour`")));
    }

    #[test]
    fn test_duplicate_field_rejected() {
        let err = parse("source/x { type: local, type: git, url: u }").unwrap_err();
        assert!(matches!(err, Error::ParseError(msg) if msg.contains("defined twice")));
    }

    #[test]
    fn test_unknown_namespace_rejected() {
        let err = parse("flavour/x { }").unwrap_err();
        assert!(matches!(err, Error::ParseError(msg) if msg.contains("invalid namespace")));
    }

    #[test]
    fn test_error_carries_position() {
        let err = parse("source/x {\n  bogus: 1\n}").unwrap_err();
        match err {
            Error::ParseError(msg) => assert!(msg.starts_with("test.chariot:2:"), "{}", msg),
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_unterminated_block_comment_rejected() {
        let err = parse("/* never closed").unwrap_err();
        assert!(matches!(err, Error::ParseError(msg) if msg.contains("unterminated block comment")));
    }

    #[test]
    fn test_unterminated_string_rejected() {
        let err = parse("source/x { type: local, url: \"no end\n }").unwrap_err();
        assert!(matches!(err, Error::ParseError(msg) if msg.contains("string does not terminate")));
    }

    #[test]
    fn test_unterminated_code_block_rejected() {
        let err = parse("target/x { build { echo").unwrap_err();
        assert!(matches!(err, Error::ParseError(msg) if msg.contains("unterminated code block")));
    }
}

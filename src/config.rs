/// Loads the nested key-value configuration grammar described in the
/// external-interfaces contract into a validated [`Config`].
///
/// The grammar is a handful of statement forms: `key = "value"`,
/// `key = ["a", "b"]`, and `key { ...nested statements... }`, each
/// optionally terminated by `;`. A scalar value may reference any
/// previously-assigned scalar by dotted path with `$(path)`
/// interpolation; referencing a path not yet assigned (including
/// self-reference) is a configuration error. Parsing is a small
/// hand-written tokenizer plus recursive-descent parser over the
/// resulting token stream — the grammar is far too small to need a
/// parser-combinator dependency.
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;

use crate::datasource::{CommandDataSource, DataSource};
use crate::error::{RetconError, RetconResult};
use crate::keys::{EntityName, EntityUniverse, SourceName};
use crate::merge::{parse_policy, MergePolicy};
use crate::store::InMemoryStore;

const ENV_VAR: &str = "RETCON_CONFIG";
const DEFAULT_COMMAND_DEADLINE: Duration = Duration::from_secs(30);

/// The log level named by `server.log-level`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn parse(s: &str) -> RetconResult<Self> {
        match s.to_ascii_uppercase().as_str() {
            "DEBUG" => Ok(LogLevel::Debug),
            "INFO" => Ok(LogLevel::Info),
            "WARN" => Ok(LogLevel::Warn),
            "ERROR" => Ok(LogLevel::Error),
            other => Err(RetconError::Config(format!(
                "invalid server.log-level '{}': expected DEBUG|INFO|WARN|ERROR",
                other
            ))),
        }
    }

    /// The string `init_logging_with_level` expects as a default filter.
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// `server { ... }`.
#[derive(Debug, Clone)]
pub struct ServerSection {
    pub listen: String,
    pub log_level: LogLevel,
    pub database: String,
}

/// One `Source1 { ... }` block under an entity.
#[derive(Debug, Clone)]
pub struct SourceSection {
    pub create: Vec<String>,
    pub read: Vec<String>,
    pub update: Vec<String>,
    pub delete: Vec<String>,
}

/// One named entity block under `entities { ... }`.
pub struct EntitySection {
    pub merge_policy: Box<dyn MergePolicy>,
    pub enabled: Vec<SourceName>,
    pub sources: BTreeMap<SourceName, SourceSection>,
}

/// `entities { ... }`.
pub struct EntitiesSection {
    pub enabled: Vec<EntityName>,
    pub entities: BTreeMap<EntityName, EntitySection>,
}

/// A fully parsed and validated configuration file.
pub struct Config {
    pub server: ServerSection,
    pub base: String,
    pub entities: EntitiesSection,
}

impl Config {
    /// Resolve `--config`, then `RETCON_CONFIG`, then the compiled-in
    /// default, read the file, and parse it.
    pub fn load(cli_flag: Option<&Path>) -> RetconResult<Config> {
        let path = resolve_path(cli_flag);
        let text = std::fs::read_to_string(&path).map_err(|e| {
            RetconError::Config(format!("reading '{}': {}", path.display(), e))
        })?;
        Config::parse(&text)
    }

    /// Parse configuration text directly, bypassing file resolution.
    pub fn parse(text: &str) -> RetconResult<Config> {
        let tokens = tokenize(text)?;
        let mut parser = Parser {
            tokens,
            pos: 0,
            scope: BTreeMap::new(),
        };
        let root = parser.parse_block("")?;
        build_config(root)
    }

    /// The universe of entities and their enabled sources, as declared.
    pub fn universe(&self) -> EntityUniverse {
        EntityUniverse::new(self.entities.entities.iter().map(|(name, section)| {
            (name.clone(), section.enabled.clone())
        }))
    }

    /// One merge policy per configured entity.
    pub fn merge_policies(&self) -> RetconResult<BTreeMap<EntityName, Box<dyn MergePolicy>>> {
        let mut out = BTreeMap::new();
        for (name, section) in &self.entities.entities {
            out.insert(name.clone(), clone_policy(section.merge_policy.as_ref())?);
        }
        Ok(out)
    }

    /// A `DataSource` adaptor for every `(entity, source)` pair named by
    /// the configured `enabled` lists.
    pub fn data_sources(
        &self,
    ) -> RetconResult<BTreeMap<(EntityName, SourceName), Arc<dyn DataSource>>> {
        let mut out = BTreeMap::new();
        for (entity, section) in &self.entities.entities {
            for source in &section.enabled {
                let cmds = section.sources.get(source).ok_or_else(|| {
                    RetconError::Config(format!(
                        "entity '{}' enables source '{}' but declares no adaptor for it",
                        entity, source
                    ))
                })?;
                let adaptor = CommandDataSource::new(
                    source.as_str(),
                    cmds.create.clone(),
                    cmds.read.clone(),
                    cmds.update.clone(),
                    cmds.delete.clone(),
                    DEFAULT_COMMAND_DEADLINE,
                );
                out.insert((entity.clone(), source.clone()), Arc::new(adaptor) as Arc<dyn DataSource>);
            }
        }
        Ok(out)
    }

    /// The store named by `server.database`. Only `memory:` is backed by
    /// a reference implementation; any other DSN is a configuration
    /// error until a durable `Store` is wired in.
    pub fn store(&self) -> RetconResult<Arc<InMemoryStore>> {
        if self.server.database == "memory:" {
            Ok(InMemoryStore::new())
        } else {
            Err(RetconError::Config(format!(
                "unsupported server.database dsn '{}' (only 'memory:' is implemented)",
                self.server.database
            )))
        }
    }
}

fn clone_policy(policy: &dyn MergePolicy) -> RetconResult<Box<dyn MergePolicy>> {
    parse_policy(&policy.name())
}

/// `--config`, then `RETCON_CONFIG`, then the compiled-in default path.
pub fn resolve_path(cli_flag: Option<&Path>) -> PathBuf {
    if let Some(path) = cli_flag {
        return path.to_path_buf();
    }
    if let Ok(env_path) = std::env::var(ENV_VAR) {
        if !env_path.is_empty() {
            return PathBuf::from(env_path);
        }
    }
    default_config_path()
}

fn default_config_path() -> PathBuf {
    if cfg!(unix) {
        PathBuf::from("/etc/retcond/retcond.conf")
    } else {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("retcond")
            .join("retcond.conf")
    }
}

// --- tokenizer ---------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Ident(String),
    Str(String),
    Eq,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Comma,
    Semicolon,
}

fn tokenize(text: &str) -> RetconResult<Vec<Token>> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = text.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '#' => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            '=' => {
                tokens.push(Token::Eq);
                i += 1;
            }
            '{' => {
                tokens.push(Token::LBrace);
                i += 1;
            }
            '}' => {
                tokens.push(Token::RBrace);
                i += 1;
            }
            '[' => {
                tokens.push(Token::LBracket);
                i += 1;
            }
            ']' => {
                tokens.push(Token::RBracket);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            ';' => {
                tokens.push(Token::Semicolon);
                i += 1;
            }
            '"' => {
                i += 1;
                let mut value = String::new();
                while i < chars.len() && chars[i] != '"' {
                    if chars[i] == '\\' && i + 1 < chars.len() {
                        value.push(chars[i + 1]);
                        i += 2;
                    } else {
                        value.push(chars[i]);
                        i += 1;
                    }
                }
                if i >= chars.len() {
                    return Err(RetconError::Config("unterminated string literal".to_string()));
                }
                i += 1; // closing quote
                tokens.push(Token::Str(value));
            }
            c if c.is_alphanumeric() || c == '_' || c == '-' || c == '.' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '-' || chars[i] == '.')
                {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => {
                return Err(RetconError::Config(format!(
                    "unexpected character '{}' in configuration",
                    other
                )))
            }
        }
    }
    Ok(tokens)
}

// --- parser --------------------------------------------------------------

/// The untyped shape every block parses into, before [`build_config`]
/// interprets it against the known grammar.
#[derive(Debug, Clone)]
enum Value {
    Scalar(String),
    List(Vec<String>),
    Block(BTreeMap<String, Value>),
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    scope: BTreeMap<String, String>,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    fn expect(&mut self, expected: &Token) -> RetconResult<()> {
        match self.advance() {
            Some(ref t) if t == expected => Ok(()),
            other => Err(RetconError::Config(format!(
                "expected {:?}, found {:?}",
                expected, other
            ))),
        }
    }

    fn parse_block(&mut self, prefix: &str) -> RetconResult<BTreeMap<String, Value>> {
        let mut block = BTreeMap::new();
        loop {
            match self.peek() {
                None | Some(Token::RBrace) => break,
                _ => {}
            }
            let key = match self.advance() {
                Some(Token::Ident(name)) => name,
                other => {
                    return Err(RetconError::Config(format!(
                        "expected a key name, found {:?}",
                        other
                    )))
                }
            };
            let path = if prefix.is_empty() {
                key.clone()
            } else {
                format!("{}.{}", prefix, key)
            };

            let value = match self.peek() {
                Some(Token::LBrace) => {
                    self.advance();
                    let nested = self.parse_block(&path)?;
                    self.expect(&Token::RBrace)?;
                    Value::Block(nested)
                }
                Some(Token::Eq) => {
                    self.advance();
                    self.parse_value(&path)?
                }
                other => {
                    return Err(RetconError::Config(format!(
                        "expected '=' or '{{' after key '{}', found {:?}",
                        key, other
                    )))
                }
            };

            if matches!(self.peek(), Some(Token::Semicolon)) {
                self.advance();
            }

            block.insert(key, value);
        }
        Ok(block)
    }

    fn parse_value(&mut self, path: &str) -> RetconResult<Value> {
        match self.advance() {
            Some(Token::Str(raw)) => {
                let resolved = interpolate(&raw, &self.scope)?;
                self.scope.insert(path.to_string(), resolved.clone());
                Ok(Value::Scalar(resolved))
            }
            Some(Token::LBracket) => {
                let mut items = Vec::new();
                loop {
                    match self.peek() {
                        Some(Token::RBracket) => {
                            self.advance();
                            break;
                        }
                        Some(Token::Str(_)) => {
                            if let Some(Token::Str(raw)) = self.advance() {
                                items.push(interpolate(&raw, &self.scope)?);
                            }
                            if matches!(self.peek(), Some(Token::Comma)) {
                                self.advance();
                            }
                        }
                        other => {
                            return Err(RetconError::Config(format!(
                                "expected a quoted list item, found {:?}",
                                other
                            )))
                        }
                    }
                }
                Ok(Value::List(items))
            }
            other => Err(RetconError::Config(format!(
                "expected a value, found {:?}",
                other
            ))),
        }
    }
}

fn interpolate(raw: &str, scope: &BTreeMap<String, String>) -> RetconResult<String> {
    let re = Regex::new(r"\$\(([A-Za-z0-9_.\-]+)\)").expect("static interpolation pattern");
    let mut out = String::new();
    let mut last = 0;
    for caps in re.captures_iter(raw) {
        let whole = caps.get(0).expect("capture 0 always present");
        let var = &caps[1];
        out.push_str(&raw[last..whole.start()]);
        let resolved = scope.get(var).ok_or_else(|| {
            RetconError::Config(format!(
                "'$({})' refers to a value not yet defined (forward or self reference)",
                var
            ))
        })?;
        out.push_str(resolved);
        last = whole.end();
    }
    out.push_str(&raw[last..]);
    Ok(out)
}

// --- grammar interpretation ----------------------------------------------

fn take_block(root: &mut BTreeMap<String, Value>, key: &str) -> RetconResult<BTreeMap<String, Value>> {
    match root.remove(key) {
        Some(Value::Block(b)) => Ok(b),
        Some(_) => Err(RetconError::Config(format!("'{}' must be a block", key))),
        None => Err(RetconError::Config(format!("missing required block '{}'", key))),
    }
}

fn take_scalar(block: &mut BTreeMap<String, Value>, key: &str) -> RetconResult<String> {
    match block.remove(key) {
        Some(Value::Scalar(s)) => Ok(s),
        Some(_) => Err(RetconError::Config(format!("'{}' must be a scalar", key))),
        None => Err(RetconError::Config(format!("missing required key '{}'", key))),
    }
}

fn take_list(block: &mut BTreeMap<String, Value>, key: &str) -> RetconResult<Vec<String>> {
    match block.remove(key) {
        Some(Value::List(items)) => Ok(items),
        Some(_) => Err(RetconError::Config(format!("'{}' must be a list", key))),
        None => Err(RetconError::Config(format!("missing required list '{}'", key))),
    }
}

fn build_config(mut root: BTreeMap<String, Value>) -> RetconResult<Config> {
    let mut server_block = take_block(&mut root, "server")?;
    let server = ServerSection {
        listen: take_scalar(&mut server_block, "listen")?,
        log_level: LogLevel::parse(&take_scalar(&mut server_block, "log-level")?)?,
        database: take_scalar(&mut server_block, "database")?,
    };

    let base = take_scalar(&mut root, "base")?;

    let mut entities_block = take_block(&mut root, "entities")?;
    let enabled_entities: Vec<EntityName> = take_list(&mut entities_block, "enabled")?
        .into_iter()
        .map(EntityName::new)
        .collect();

    let mut entities = BTreeMap::new();
    for name in &enabled_entities {
        let mut entity_block = take_block(&mut entities_block, name.as_str())?;
        let merge_policy = parse_policy(&take_scalar(&mut entity_block, "merge-policy")?)?;
        let enabled_sources: Vec<SourceName> = take_list(&mut entity_block, "enabled")?
            .into_iter()
            .map(SourceName::new)
            .collect();

        let mut sources = BTreeMap::new();
        for source in &enabled_sources {
            let mut source_block = take_block(&mut entity_block, source.as_str())?;
            let section = SourceSection {
                create: split_command(&take_scalar(&mut source_block, "create")?),
                read: split_command(&take_scalar(&mut source_block, "read")?),
                update: split_command(&take_scalar(&mut source_block, "update")?),
                delete: split_command(&take_scalar(&mut source_block, "delete")?),
            };
            sources.insert(source.clone(), section);
        }

        entities.insert(
            name.clone(),
            EntitySection {
                merge_policy,
                enabled: enabled_sources,
                sources,
            },
        );
    }

    Ok(Config {
        server,
        base,
        entities: EntitiesSection {
            enabled: enabled_entities,
            entities,
        },
    })
}

fn split_command(cmd: &str) -> Vec<String> {
    cmd.split_whitespace().map(str::to_string).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        server {
            listen = "tcp://0.0.0.0:8080"
            log-level = "INFO"
            database = "memory:"
        }
        base = "/var/lib/retcond"
        entities {
            enabled = ["customer"]
            customer {
                merge-policy = "ignore-conflicts"
                enabled = ["data", "test-results"]
                data {
                    create = "adaptor create %entity"
                    read = "adaptor read %entity %fk"
                    update = "adaptor update %entity %fk"
                    delete = "adaptor delete %entity %fk"
                }
                test-results {
                    create = "$(base)/adaptor create %entity"
                    read = "$(base)/adaptor read %entity %fk"
                    update = "$(base)/adaptor update %entity %fk"
                    delete = "$(base)/adaptor delete %entity %fk"
                }
            }
        }
    "#;

    #[test]
    fn parses_the_sample_grammar() {
        let config = Config::parse(SAMPLE).unwrap();
        assert_eq!(config.server.listen, "tcp://0.0.0.0:8080");
        assert!(matches!(config.server.log_level, LogLevel::Info));
        assert_eq!(config.base, "/var/lib/retcond");
        assert_eq!(config.entities.enabled, vec![EntityName::new("customer")]);
    }

    #[test]
    fn interpolates_a_previously_defined_scalar() {
        let config = Config::parse(SAMPLE).unwrap();
        let customer = &config.entities.entities[&EntityName::new("customer")];
        let test_results = &customer.sources[&SourceName::new("test-results")];
        assert_eq!(
            test_results.create,
            vec!["/var/lib/retcond/adaptor", "create", "%entity"]
        );
    }

    #[test]
    fn forward_reference_is_a_config_error() {
        let bad = r#"
            server { listen = "$(base)"; log-level = "INFO"; database = "memory:" }
            base = "/x"
            entities { enabled = [] }
        "#;
        assert!(Config::parse(bad).is_err());
    }

    #[test]
    fn self_reference_is_a_config_error() {
        let bad = r#"
            server { listen = "x"; log-level = "INFO"; database = "memory:" }
            base = "$(base)"
            entities { enabled = [] }
        "#;
        assert!(Config::parse(bad).is_err());
    }

    #[test]
    fn unknown_merge_policy_is_rejected() {
        let bad = r#"
            server { listen = "x"; log-level = "INFO"; database = "memory:" }
            base = "/x"
            entities {
                enabled = ["customer"]
                customer {
                    merge-policy = "nonsense"
                    enabled = []
                }
            }
        "#;
        assert!(Config::parse(bad).is_err());
    }

    #[test]
    fn resolve_path_prefers_explicit_flag_over_env() {
        std::env::set_var(ENV_VAR, "/env/retcond.conf");
        let resolved = resolve_path(Some(Path::new("/flag/retcond.conf")));
        std::env::remove_var(ENV_VAR);
        assert_eq!(resolved, PathBuf::from("/flag/retcond.conf"));
    }

    #[test]
    fn resolve_path_falls_back_to_env_var() {
        std::env::set_var(ENV_VAR, "/env/retcond.conf");
        let resolved = resolve_path(None);
        std::env::remove_var(ENV_VAR);
        assert_eq!(resolved, PathBuf::from("/env/retcond.conf"));
    }

    #[test]
    fn universe_reflects_configured_entities_and_sources() {
        let config = Config::parse(SAMPLE).unwrap();
        let universe = config.universe();
        assert!(universe.knows_entity(&EntityName::new("customer")));
        assert!(universe.knows_source(&EntityName::new("customer"), &SourceName::new("data")));
    }
}

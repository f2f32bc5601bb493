//! Command table for the single-node engine
//!
//! Every command declares its arity, whether it writes, which keys it reads
//! and writes, and an executor working on a [`Keyspace`]. The cluster layer
//! relies on the key declarations for routing, locking and undo logs.

use super::error::{Result, ShardisError};
use super::types::{StoredValue, now_millis};
use crate::protocol::{CmdLine, Reply};
use bytes::Bytes;
use lazy_static::lazy_static;
use radix_trie::Trie;
use std::collections::HashMap;

/// Key mutation observed while a command ran
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyEvent {
    Inserted(String),
    Deleted(String),
}

/// Mutable view over the data trie that records key events and expires
/// stale entries lazily.
pub struct Keyspace<'a> {
    data: &'a mut Trie<String, StoredValue>,
    events: Vec<KeyEvent>,
    now: u64,
}

impl<'a> Keyspace<'a> {
    pub fn new(data: &'a mut Trie<String, StoredValue>) -> Self {
        Self {
            data,
            events: Vec::new(),
            now: now_millis(),
        }
    }

    pub fn into_events(self) -> Vec<KeyEvent> {
        self.events
    }

    pub fn now(&self) -> u64 {
        self.now
    }

    fn expire_if_needed(&mut self, key: &str) {
        let expired = self
            .data
            .get(key)
            .is_some_and(|v| v.is_expired_at(self.now));
        if expired {
            self.data.remove(key);
            self.events.push(KeyEvent::Deleted(key.to_string()));
        }
    }

    pub fn get(&mut self, key: &str) -> Option<&StoredValue> {
        self.expire_if_needed(key);
        self.data.get(key)
    }

    /// In-place update; reported as an insert so observers see the touch
    pub fn get_mut(&mut self, key: &str) -> Option<&mut StoredValue> {
        self.expire_if_needed(key);
        let value = self.data.get_mut(key)?;
        self.events.push(KeyEvent::Inserted(key.to_string()));
        Some(value)
    }

    pub fn contains(&mut self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn put(&mut self, key: &str, value: StoredValue) {
        self.data.insert(key.to_string(), value);
        self.events.push(KeyEvent::Inserted(key.to_string()));
    }

    pub fn remove(&mut self, key: &str) -> Option<StoredValue> {
        self.expire_if_needed(key);
        let removed = self.data.remove(key);
        if removed.is_some() {
            self.events.push(KeyEvent::Deleted(key.to_string()));
        }
        removed
    }

    pub fn keys(&self) -> Vec<String> {
        use radix_trie::TrieCommon;
        self.data
            .iter()
            .filter(|(_, v)| !v.is_expired_at(self.now))
            .map(|(k, _)| k.clone())
            .collect()
    }

    pub fn clear(&mut self) -> usize {
        let keys: Vec<String> = {
            use radix_trie::TrieCommon;
            self.data.keys().cloned().collect()
        };
        for key in &keys {
            self.data.remove(key);
            self.events.push(KeyEvent::Deleted(key.clone()));
        }
        keys.len()
    }
}

type ExecFn = fn(&mut Keyspace<'_>, &[Bytes]) -> Result<Reply>;
type KeysFn = fn(&[Bytes]) -> (Vec<String>, Vec<String>);

pub struct CommandDef {
    pub name: &'static str,
    /// Positive: exact argument count including the name; negative: minimum
    pub arity: i32,
    pub write: bool,
    keys: KeysFn,
    exec: ExecFn,
}

impl CommandDef {
    pub fn check_arity(&self, argc: usize) -> bool {
        if self.arity >= 0 {
            argc == self.arity as usize
        } else {
            argc >= self.arity.unsigned_abs() as usize
        }
    }

    /// Keys as (write_keys, read_keys)
    pub fn related_keys(&self, args: &[Bytes]) -> (Vec<String>, Vec<String>) {
        (self.keys)(args)
    }

    pub fn execute(&self, ks: &mut Keyspace<'_>, args: &[Bytes]) -> Result<Reply> {
        (self.exec)(ks, args)
    }
}

lazy_static! {
    static ref COMMANDS: HashMap<&'static str, CommandDef> = {
        let defs = vec![
            def("ping", -1, false, no_keys, exec_ping),
            def("echo", 2, false, no_keys, exec_echo),
            def("set", -3, true, first_key_write, exec_set),
            def("setnx", 3, true, first_key_write, exec_setnx),
            def("setex", 4, true, first_key_write, exec_setex),
            def("get", 2, false, first_key_read, exec_get),
            def("getdel", 2, true, first_key_write, exec_getdel),
            def("del", -2, true, all_keys_write, exec_del),
            def("exists", -2, false, all_keys_read, exec_exists),
            def("mset", -3, true, pair_keys_write, exec_mset),
            def("msetnx", -3, true, pair_keys_write, exec_msetnx),
            def("mget", -2, false, all_keys_read, exec_mget),
            def("incr", 2, true, first_key_write, exec_incr),
            def("decr", 2, true, first_key_write, exec_decr),
            def("incrby", 3, true, first_key_write, exec_incrby),
            def("decrby", 3, true, first_key_write, exec_decrby),
            def("append", 3, true, first_key_write, exec_append),
            def("strlen", 2, false, first_key_read, exec_strlen),
            def("expire", 3, true, first_key_write, exec_expire),
            def("pexpire", 3, true, first_key_write, exec_pexpire),
            def("expireat", 3, true, first_key_write, exec_expireat),
            def("pexpireat", 3, true, first_key_write, exec_pexpireat),
            def("ttl", 2, false, first_key_read, exec_ttl),
            def("pttl", 2, false, first_key_read, exec_pttl),
            def("persist", 2, true, first_key_write, exec_persist),
            def("type", 2, false, first_key_read, exec_type),
            def("rename", 3, true, two_keys_write, exec_rename),
            def("renamenx", 3, true, two_keys_write, exec_renamenx),
            def("copy", -3, true, copy_keys, exec_copy),
            def("keys", 2, false, no_keys, exec_keys),
            def("dbsize", 1, false, no_keys, exec_dbsize),
            def("flushdb", -1, true, no_keys, exec_flushdb),
            def("flushall", -1, true, no_keys, exec_flushdb),
        ];
        defs.into_iter().map(|s| (s.name, s)).collect()
    };
}

fn def(name: &'static str, arity: i32, write: bool, keys: KeysFn, exec: ExecFn) -> CommandDef {
    CommandDef {
        name,
        arity,
        write,
        keys,
        exec,
    }
}

/// Look up a command by (case-insensitive) name
pub fn lookup(name: &str) -> Option<&'static CommandDef> {
    COMMANDS.get(name.to_ascii_lowercase().as_str())
}

pub fn command_name(cmdline: &CmdLine) -> String {
    cmdline
        .first()
        .map(|n| String::from_utf8_lossy(n).to_ascii_lowercase())
        .unwrap_or_default()
}

pub fn key_string(b: &Bytes) -> String {
    String::from_utf8_lossy(b).into_owned()
}

fn arg_str(b: &Bytes) -> String {
    String::from_utf8_lossy(b).to_ascii_lowercase()
}

fn parse_i64(b: &Bytes) -> Result<i64> {
    std::str::from_utf8(b)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or(ShardisError::NotAnInteger)
}

// ---------------------------------------------------------------------------
// Key extraction
// ---------------------------------------------------------------------------

fn no_keys(_: &[Bytes]) -> (Vec<String>, Vec<String>) {
    (Vec::new(), Vec::new())
}

fn first_key_write(args: &[Bytes]) -> (Vec<String>, Vec<String>) {
    (args.get(1).map(key_string).into_iter().collect(), Vec::new())
}

fn first_key_read(args: &[Bytes]) -> (Vec<String>, Vec<String>) {
    (Vec::new(), args.get(1).map(key_string).into_iter().collect())
}

fn all_keys_write(args: &[Bytes]) -> (Vec<String>, Vec<String>) {
    (args.iter().skip(1).map(key_string).collect(), Vec::new())
}

fn all_keys_read(args: &[Bytes]) -> (Vec<String>, Vec<String>) {
    (Vec::new(), args.iter().skip(1).map(key_string).collect())
}

fn pair_keys_write(args: &[Bytes]) -> (Vec<String>, Vec<String>) {
    (
        args.iter().skip(1).step_by(2).map(key_string).collect(),
        Vec::new(),
    )
}

fn two_keys_write(args: &[Bytes]) -> (Vec<String>, Vec<String>) {
    (args.iter().skip(1).take(2).map(key_string).collect(), Vec::new())
}

fn copy_keys(args: &[Bytes]) -> (Vec<String>, Vec<String>) {
    (
        args.get(2).map(key_string).into_iter().collect(),
        args.get(1).map(key_string).into_iter().collect(),
    )
}

// ---------------------------------------------------------------------------
// Executors
// ---------------------------------------------------------------------------

fn exec_ping(_: &mut Keyspace<'_>, args: &[Bytes]) -> Result<Reply> {
    match args.get(1) {
        Some(msg) => Ok(Reply::Bulk(msg.clone())),
        None => Ok(Reply::Status("PONG".to_string())),
    }
}

fn exec_echo(_: &mut Keyspace<'_>, args: &[Bytes]) -> Result<Reply> {
    Ok(Reply::Bulk(args[1].clone()))
}

fn exec_set(ks: &mut Keyspace<'_>, args: &[Bytes]) -> Result<Reply> {
    let key = key_string(&args[1]);
    let mut expires_at = None;
    let mut nx = false;
    let mut xx = false;
    let mut keep_ttl = false;

    let mut i = 3;
    while i < args.len() {
        match arg_str(&args[i]).as_str() {
            "nx" => nx = true,
            "xx" => xx = true,
            "keepttl" => keep_ttl = true,
            opt @ ("ex" | "px" | "exat" | "pxat") => {
                let raw = args.get(i + 1).ok_or(ShardisError::Syntax)?;
                let n = parse_i64(raw)?;
                if n <= 0 {
                    return Err(ShardisError::InvalidExpire("set".to_string()));
                }
                let n = n as u64;
                expires_at = Some(match opt {
                    "ex" => ks.now() + n * 1000,
                    "px" => ks.now() + n,
                    "exat" => n * 1000,
                    _ => n,
                });
                i += 1;
            }
            _ => return Err(ShardisError::Syntax),
        }
        i += 1;
    }
    if nx && xx || keep_ttl && expires_at.is_some() {
        return Err(ShardisError::Syntax);
    }

    let existing = ks.get(&key).cloned();
    if nx && existing.is_some() || xx && existing.is_none() {
        return Ok(Reply::Null);
    }
    if keep_ttl {
        expires_at = existing.and_then(|v| v.expires_at);
    }
    ks.put(&key, StoredValue::new(args[2].to_vec(), expires_at));
    Ok(Reply::ok())
}

fn exec_setnx(ks: &mut Keyspace<'_>, args: &[Bytes]) -> Result<Reply> {
    let key = key_string(&args[1]);
    if ks.contains(&key) {
        return Ok(Reply::Integer(0));
    }
    ks.put(&key, StoredValue::new(args[2].to_vec(), None));
    Ok(Reply::Integer(1))
}

fn exec_setex(ks: &mut Keyspace<'_>, args: &[Bytes]) -> Result<Reply> {
    let secs = parse_i64(&args[2])?;
    if secs <= 0 {
        return Err(ShardisError::InvalidExpire("setex".to_string()));
    }
    let expires_at = ks.now() + secs as u64 * 1000;
    ks.put(
        &key_string(&args[1]),
        StoredValue::new(args[3].to_vec(), Some(expires_at)),
    );
    Ok(Reply::ok())
}

fn exec_get(ks: &mut Keyspace<'_>, args: &[Bytes]) -> Result<Reply> {
    Ok(match ks.get(&key_string(&args[1])) {
        Some(v) => Reply::bulk(v.data.clone()),
        None => Reply::Null,
    })
}

fn exec_getdel(ks: &mut Keyspace<'_>, args: &[Bytes]) -> Result<Reply> {
    Ok(match ks.remove(&key_string(&args[1])) {
        Some(v) => Reply::bulk(v.data),
        None => Reply::Null,
    })
}

fn exec_del(ks: &mut Keyspace<'_>, args: &[Bytes]) -> Result<Reply> {
    let removed = args[1..]
        .iter()
        .filter(|k| ks.remove(&key_string(k)).is_some())
        .count();
    Ok(Reply::Integer(removed as i64))
}

fn exec_exists(ks: &mut Keyspace<'_>, args: &[Bytes]) -> Result<Reply> {
    let found = args[1..]
        .iter()
        .filter(|k| ks.contains(&key_string(k)))
        .count();
    Ok(Reply::Integer(found as i64))
}

fn exec_mset(ks: &mut Keyspace<'_>, args: &[Bytes]) -> Result<Reply> {
    if args.len() % 2 != 1 {
        return Err(ShardisError::WrongArity("mset".to_string()));
    }
    for pair in args[1..].chunks(2) {
        ks.put(&key_string(&pair[0]), StoredValue::new(pair[1].to_vec(), None));
    }
    Ok(Reply::ok())
}

fn exec_msetnx(ks: &mut Keyspace<'_>, args: &[Bytes]) -> Result<Reply> {
    if args.len() % 2 != 1 {
        return Err(ShardisError::WrongArity("msetnx".to_string()));
    }
    if args[1..]
        .chunks(2)
        .any(|pair| ks.contains(&key_string(&pair[0])))
    {
        return Ok(Reply::Integer(0));
    }
    for pair in args[1..].chunks(2) {
        ks.put(&key_string(&pair[0]), StoredValue::new(pair[1].to_vec(), None));
    }
    Ok(Reply::Integer(1))
}

fn exec_mget(ks: &mut Keyspace<'_>, args: &[Bytes]) -> Result<Reply> {
    let values = args[1..]
        .iter()
        .map(|k| match ks.get(&key_string(k)) {
            Some(v) => Reply::bulk(v.data.clone()),
            None => Reply::Null,
        })
        .collect();
    Ok(Reply::Array(values))
}

fn incr_by(ks: &mut Keyspace<'_>, key: &Bytes, delta: i64) -> Result<Reply> {
    let key = key_string(key);
    let (current, expires_at) = match ks.get(&key) {
        Some(v) => (
            std::str::from_utf8(&v.data)
                .ok()
                .and_then(|s| s.parse::<i64>().ok())
                .ok_or(ShardisError::NotAnInteger)?,
            v.expires_at,
        ),
        None => (0, None),
    };
    let next = current
        .checked_add(delta)
        .ok_or(ShardisError::NotAnInteger)?;
    ks.put(
        &key,
        StoredValue::new(next.to_string().into_bytes(), expires_at),
    );
    Ok(Reply::Integer(next))
}

fn exec_incr(ks: &mut Keyspace<'_>, args: &[Bytes]) -> Result<Reply> {
    incr_by(ks, &args[1], 1)
}

fn exec_decr(ks: &mut Keyspace<'_>, args: &[Bytes]) -> Result<Reply> {
    incr_by(ks, &args[1], -1)
}

fn exec_incrby(ks: &mut Keyspace<'_>, args: &[Bytes]) -> Result<Reply> {
    let delta = parse_i64(&args[2])?;
    incr_by(ks, &args[1], delta)
}

fn exec_decrby(ks: &mut Keyspace<'_>, args: &[Bytes]) -> Result<Reply> {
    let delta = parse_i64(&args[2])?;
    incr_by(ks, &args[1], delta.checked_neg().ok_or(ShardisError::NotAnInteger)?)
}

fn exec_append(ks: &mut Keyspace<'_>, args: &[Bytes]) -> Result<Reply> {
    let key = key_string(&args[1]);
    let mut value = ks
        .get(&key)
        .cloned()
        .unwrap_or_else(|| StoredValue::new(Vec::new(), None));
    value.data.extend_from_slice(&args[2]);
    let len = value.data.len();
    ks.put(&key, value);
    Ok(Reply::Integer(len as i64))
}

fn exec_strlen(ks: &mut Keyspace<'_>, args: &[Bytes]) -> Result<Reply> {
    let len = ks.get(&key_string(&args[1])).map_or(0, |v| v.data.len());
    Ok(Reply::Integer(len as i64))
}

fn set_expiration(ks: &mut Keyspace<'_>, key: &Bytes, expires_at: u64) -> Result<Reply> {
    let key = key_string(key);
    if expires_at <= ks.now() {
        let removed = ks.remove(&key).is_some();
        return Ok(Reply::Integer(i64::from(removed)));
    }
    match ks.get_mut(&key) {
        Some(v) => {
            v.expires_at = Some(expires_at);
            Ok(Reply::Integer(1))
        }
        None => Ok(Reply::Integer(0)),
    }
}

fn exec_expire(ks: &mut Keyspace<'_>, args: &[Bytes]) -> Result<Reply> {
    let secs = parse_i64(&args[2])?;
    let at = (ks.now() as i64).saturating_add(secs.saturating_mul(1000));
    set_expiration(ks, &args[1], at.max(0) as u64)
}

fn exec_pexpire(ks: &mut Keyspace<'_>, args: &[Bytes]) -> Result<Reply> {
    let ms = parse_i64(&args[2])?;
    let at = (ks.now() as i64).saturating_add(ms);
    set_expiration(ks, &args[1], at.max(0) as u64)
}

fn exec_expireat(ks: &mut Keyspace<'_>, args: &[Bytes]) -> Result<Reply> {
    let secs = parse_i64(&args[2])?;
    set_expiration(ks, &args[1], secs.saturating_mul(1000).max(0) as u64)
}

fn exec_pexpireat(ks: &mut Keyspace<'_>, args: &[Bytes]) -> Result<Reply> {
    let ms = parse_i64(&args[2])?;
    set_expiration(ks, &args[1], ms.max(0) as u64)
}

fn exec_ttl(ks: &mut Keyspace<'_>, args: &[Bytes]) -> Result<Reply> {
    Ok(Reply::Integer(match ks.get(&key_string(&args[1])) {
        None => -2,
        Some(v) => match v.remaining_ttl_ms() {
            None => -1,
            Some(ms) => (ms.div_ceil(1000)) as i64,
        },
    }))
}

fn exec_pttl(ks: &mut Keyspace<'_>, args: &[Bytes]) -> Result<Reply> {
    Ok(Reply::Integer(match ks.get(&key_string(&args[1])) {
        None => -2,
        Some(v) => v.remaining_ttl_ms().map_or(-1, |ms| ms as i64),
    }))
}

fn exec_persist(ks: &mut Keyspace<'_>, args: &[Bytes]) -> Result<Reply> {
    match ks.get_mut(&key_string(&args[1])) {
        Some(v) if v.expires_at.is_some() => {
            v.expires_at = None;
            Ok(Reply::Integer(1))
        }
        _ => Ok(Reply::Integer(0)),
    }
}

fn exec_type(ks: &mut Keyspace<'_>, args: &[Bytes]) -> Result<Reply> {
    let kind = if ks.contains(&key_string(&args[1])) {
        "string"
    } else {
        "none"
    };
    Ok(Reply::Status(kind.to_string()))
}

fn exec_rename(ks: &mut Keyspace<'_>, args: &[Bytes]) -> Result<Reply> {
    let src = key_string(&args[1]);
    let dst = key_string(&args[2]);
    let value = ks
        .remove(&src)
        .ok_or_else(|| ShardisError::KeyNotFound(src.clone()))?;
    ks.remove(&dst);
    ks.put(&dst, value);
    Ok(Reply::ok())
}

fn exec_renamenx(ks: &mut Keyspace<'_>, args: &[Bytes]) -> Result<Reply> {
    let src = key_string(&args[1]);
    let dst = key_string(&args[2]);
    if !ks.contains(&src) {
        return Err(ShardisError::KeyNotFound(src));
    }
    if ks.contains(&dst) {
        return Ok(Reply::Integer(0));
    }
    if let Some(value) = ks.remove(&src) {
        ks.put(&dst, value);
    }
    Ok(Reply::Integer(1))
}

fn exec_copy(ks: &mut Keyspace<'_>, args: &[Bytes]) -> Result<Reply> {
    let src = key_string(&args[1]);
    let dst = key_string(&args[2]);
    let replace = match args.get(3) {
        None => false,
        Some(opt) if arg_str(opt) == "replace" && args.len() == 4 => true,
        Some(_) => return Err(ShardisError::Syntax),
    };
    let Some(value) = ks.get(&src).cloned() else {
        return Ok(Reply::Integer(0));
    };
    if ks.contains(&dst) && !replace {
        return Ok(Reply::Integer(0));
    }
    ks.put(&dst, value);
    Ok(Reply::Integer(1))
}

fn exec_keys(ks: &mut Keyspace<'_>, args: &[Bytes]) -> Result<Reply> {
    let pattern = key_string(&args[1]);
    let mut keys: Vec<String> = ks
        .keys()
        .into_iter()
        .filter(|k| glob_match(pattern.as_bytes(), k.as_bytes()))
        .collect();
    keys.sort();
    Ok(Reply::Array(keys.into_iter().map(Reply::bulk).collect()))
}

fn exec_dbsize(ks: &mut Keyspace<'_>, _: &[Bytes]) -> Result<Reply> {
    Ok(Reply::Integer(ks.keys().len() as i64))
}

fn exec_flushdb(ks: &mut Keyspace<'_>, _: &[Bytes]) -> Result<Reply> {
    ks.clear();
    Ok(Reply::ok())
}

/// Glob matching supporting `*`, `?` and `\` escapes
pub fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
    let (mut p, mut t) = (0, 0);
    let mut star: Option<(usize, usize)> = None;
    while t < text.len() {
        if p < pattern.len() {
            match pattern[p] {
                b'*' => {
                    star = Some((p, t));
                    p += 1;
                    continue;
                }
                b'?' => {
                    p += 1;
                    t += 1;
                    continue;
                }
                b'\\' if p + 1 < pattern.len() && pattern[p + 1] == text[t] => {
                    p += 2;
                    t += 1;
                    continue;
                }
                c if c == text[t] => {
                    p += 1;
                    t += 1;
                    continue;
                }
                _ => {}
            }
        }
        match star {
            Some((sp, st)) => {
                p = sp + 1;
                t = st + 1;
                star = Some((sp, st + 1));
            }
            None => return false,
        }
    }
    pattern[p..].iter().all(|&c| c == b'*')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::to_cmdline;

    fn run(data: &mut Trie<String, StoredValue>, parts: &[&str]) -> Reply {
        let cmd = to_cmdline(parts.iter().copied());
        let def = lookup(parts[0]).unwrap();
        assert!(def.check_arity(cmd.len()));
        let mut ks = Keyspace::new(data);
        def.execute(&mut ks, &cmd).unwrap_or_else(Reply::from)
    }

    #[test]
    fn test_related_keys() {
        let mset = to_cmdline(["MSET", "a", "1", "b", "2"]);
        assert_eq!(
            lookup("mset").unwrap().related_keys(&mset),
            (vec!["a".to_string(), "b".to_string()], vec![])
        );

        let copy = to_cmdline(["COPY", "src", "dst"]);
        assert_eq!(
            lookup("COPY").unwrap().related_keys(&copy),
            (vec!["dst".to_string()], vec!["src".to_string()])
        );
    }

    #[test]
    fn test_arity() {
        let get = lookup("get").unwrap();
        assert!(get.check_arity(2));
        assert!(!get.check_arity(3));
        let del = lookup("del").unwrap();
        assert!(!del.check_arity(1));
        assert!(del.check_arity(5));
    }

    #[test]
    fn test_set_nx_xx() {
        let mut data = Trie::new();
        assert_eq!(run(&mut data, &["SET", "k", "v", "XX"]), Reply::Null);
        assert!(run(&mut data, &["SET", "k", "v", "NX"]).is_ok());
        assert_eq!(run(&mut data, &["SET", "k", "w", "NX"]), Reply::Null);
        assert_eq!(run(&mut data, &["GET", "k"]), Reply::bulk("v"));
    }

    #[test]
    fn test_rename_missing_source() {
        let mut data = Trie::new();
        assert!(run(&mut data, &["RENAME", "a", "b"]).is_error());
    }

    #[test]
    fn test_expired_key_is_reported_deleted() {
        let mut data = Trie::new();
        data.insert("k".to_string(), StoredValue::new(b"v".to_vec(), Some(1)));
        let mut ks = Keyspace::new(&mut data);
        assert!(ks.get("k").is_none());
        assert_eq!(ks.into_events(), vec![KeyEvent::Deleted("k".to_string())]);
    }

    #[test]
    fn test_ttl_reporting() {
        let mut data = Trie::new();
        run(&mut data, &["SET", "k", "v"]);
        assert_eq!(run(&mut data, &["TTL", "k"]), Reply::Integer(-1));
        assert_eq!(run(&mut data, &["TTL", "missing"]), Reply::Integer(-2));
        run(&mut data, &["EXPIRE", "k", "100"]);
        assert_eq!(run(&mut data, &["TTL", "k"]), Reply::Integer(100));
        assert_eq!(run(&mut data, &["PERSIST", "k"]), Reply::Integer(1));
        assert_eq!(run(&mut data, &["TTL", "k"]), Reply::Integer(-1));
    }

    #[test]
    fn test_glob_match() {
        assert!(glob_match(b"user:*", b"user:1"));
        assert!(glob_match(b"h?llo", b"hello"));
        assert!(glob_match(b"*", b""));
        assert!(!glob_match(b"user:*", b"order:1"));
        assert!(glob_match(b"a*b*c", b"axxbyyc"));
    }
}

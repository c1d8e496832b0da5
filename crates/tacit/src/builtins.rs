//! The standard intrinsic set.
//!
//! These are ordinary registry entries; an embedding host can add its own
//! alongside them (or shadow them by name). Query-style intrinsics are
//! lenient about receiver types — asking for the `len` of a number yields
//! null rather than an error — while structural ones (`insert`, `remove`,
//! `range`) report type mismatches.

use std::rc::Rc;

use crate::error::{Error, Result};
use crate::intrinsic::{IntrinsicRegistry, IntrinsicResult, IntrinsicSpec};
use crate::value::{MAX_LIST_SIZE, RECURSION_DEPTH, Value, ValueMap};

use IntrinsicResult::{Done, Partial};

fn done(v: Value) -> Result<IntrinsicResult> {
    Ok(Done(v))
}

/// Clamp a possibly-negative slice bound into [0, len].
fn slice_bound(bound: Option<f64>, len: usize, default: usize) -> usize {
    match bound {
        None => default,
        Some(b) => {
            let mut i = b.trunc() as i64;
            if i < 0 {
                i += len as i64;
            }
            i.clamp(0, len as i64) as usize
        }
    }
}

/// Index for `insert`: like normal indexing but the one-past-the-end
/// position is allowed.
fn insert_index(index: f64, len: usize) -> Result<usize> {
    if index != index.trunc() {
        return Err(Error::type_mismatch("index must be an integer"));
    }
    let mut i = index as i64;
    if i < 0 {
        i += len as i64 + 1;
    }
    if i < 0 || i > len as i64 {
        return Err(Error::index_out_of_range(index));
    }
    Ok(i as usize)
}

fn sort_key(item: &Value, by_key: &Value) -> Value {
    match item {
        Value::Map(m) => m.borrow().get(by_key).unwrap_or(Value::Null),
        Value::List(l) => match by_key.as_number() {
            Some(n) => {
                let l = l.borrow();
                let mut i = n.trunc() as i64;
                if i < 0 {
                    i += l.len() as i64;
                }
                l.get(i.max(0) as usize).cloned().unwrap_or(Value::Null)
            }
            None => Value::Null,
        },
        _ => Value::Null,
    }
}

/// Register the whole standard set into a registry.
pub(crate) fn register_standard(reg: &mut IntrinsicRegistry) {
    // --- output -----------------------------------------------------------
    reg.register(
        IntrinsicSpec::new("print").param("s", ""),
        Rc::new(|vm, _| {
            let s = vm.local("s").to_display_string();
            vm.print_line(&s);
            done(Value::Null)
        }),
    );

    // --- conversions ------------------------------------------------------
    reg.register(
        IntrinsicSpec::new("str").param("self", ""),
        Rc::new(|vm, _| done(Value::from(vm.local("self").to_display_string()))),
    );

    reg.register(
        IntrinsicSpec::new("val").param("self", 0),
        Rc::new(|vm, _| {
            let v = vm.local("self");
            match &v {
                Value::Number(_) => done(v),
                Value::Str(s) => done(Value::Number(s.trim().parse::<f64>().unwrap_or(0.0))),
                _ => done(Value::Null),
            }
        }),
    );

    reg.register(
        IntrinsicSpec::new("char").param("codePoint", 65),
        Rc::new(|vm, _| {
            let n = vm.local("codePoint").as_number().unwrap_or(0.0);
            let c = char::from_u32(n as u32).unwrap_or('\u{FFFD}');
            done(Value::from(c.to_string()))
        }),
    );

    reg.register(
        IntrinsicSpec::new("code").param("self", ""),
        Rc::new(|vm, _| {
            let v = vm.local("self");
            match v.as_str().and_then(|s| s.chars().next()) {
                Some(c) => done(Value::from(c as usize)),
                None => done(Value::Null),
            }
        }),
    );

    // --- math -------------------------------------------------------------
    reg.register(
        IntrinsicSpec::new("abs").param("x", 0),
        Rc::new(|vm, _| done(Value::Number(vm.local("x").as_number().unwrap_or(0.0).abs()))),
    );

    reg.register(
        IntrinsicSpec::new("sign").param("x", 0),
        Rc::new(|vm, _| {
            let x = vm.local("x").as_number().unwrap_or(0.0);
            let s = if x > 0.0 {
                1.0
            } else if x < 0.0 {
                -1.0
            } else {
                0.0
            };
            done(Value::Number(s))
        }),
    );

    reg.register(
        IntrinsicSpec::new("floor").param("x", 0),
        Rc::new(|vm, _| done(Value::Number(vm.local("x").as_number().unwrap_or(0.0).floor()))),
    );

    reg.register(
        IntrinsicSpec::new("ceil").param("x", 0),
        Rc::new(|vm, _| done(Value::Number(vm.local("x").as_number().unwrap_or(0.0).ceil()))),
    );

    reg.register(
        IntrinsicSpec::new("round").param("x", 0).param("decimalPlaces", 0),
        Rc::new(|vm, _| {
            let x = vm.local("x").as_number().unwrap_or(0.0);
            let places = vm.local("decimalPlaces").as_number().unwrap_or(0.0);
            let factor = 10f64.powf(places.trunc());
            done(Value::Number((x * factor).round() / factor))
        }),
    );

    reg.register(
        IntrinsicSpec::new("sqrt").param("x", 0),
        Rc::new(|vm, _| done(Value::Number(vm.local("x").as_number().unwrap_or(0.0).sqrt()))),
    );

    reg.register(
        IntrinsicSpec::new("pi"),
        Rc::new(|_, _| done(Value::Number(std::f64::consts::PI))),
    );

    reg.register(
        IntrinsicSpec::new("rnd").param("seed", Value::Null),
        Rc::new(|vm, _| {
            if let Some(seed) = vm.local("seed").as_number() {
                vm.reseed(seed as i64 as u64);
            }
            let r = vm.random();
            done(Value::Number(r))
        }),
    );

    // --- scheduling -------------------------------------------------------
    reg.register(
        IntrinsicSpec::new("time"),
        Rc::new(|vm, _| done(Value::Number(vm.run_time()))),
    );

    // Parks until the machine clock passes the deadline computed on first
    // entry; the deadline rides along as the partial result.
    reg.register(
        IntrinsicSpec::new("wait").param("seconds", 1.0),
        Rc::new(|vm, partial| {
            let now = vm.run_time();
            match partial {
                None => {
                    let seconds = vm.local("seconds").as_number().unwrap_or(0.0);
                    Ok(Partial(Value::Number(now + seconds)))
                }
                Some(Value::Number(deadline)) => {
                    if now >= deadline {
                        done(Value::Null)
                    } else {
                        Ok(Partial(Value::Number(deadline)))
                    }
                }
                Some(_) => done(Value::Null),
            }
        }),
    );

    reg.register(
        IntrinsicSpec::new("yield"),
        Rc::new(|vm, _| {
            vm.set_yielding(true);
            done(Value::Null)
        }),
    );

    reg.register(
        IntrinsicSpec::new("version"),
        Rc::new(|vm, _| {
            let info = vm.host_info().clone();
            let mut m = ValueMap::new();
            m.insert_str("language", Value::from(env!("CARGO_PKG_VERSION")));
            m.insert_str("host", Value::from(info.version));
            m.insert_str("hostName", Value::from(info.name));
            m.insert_str("hostInfo", Value::from(info.info));
            done(Value::map(m))
        }),
    );

    // --- sequences --------------------------------------------------------
    reg.register(
        IntrinsicSpec::new("len").param("self", Value::Null),
        Rc::new(|vm, _| {
            let v = vm.local("self");
            match &v {
                Value::Str(s) => done(Value::from(s.chars().count())),
                Value::List(l) => done(Value::from(l.borrow().len())),
                Value::Map(m) => done(Value::from(m.borrow().len())),
                _ => done(Value::Null),
            }
        }),
    );

    reg.register(
        IntrinsicSpec::new("range")
            .param("from", 0)
            .param("to", 0)
            .param("step", Value::Null),
        Rc::new(|vm, _| {
            let from = vm.local("from").as_number().unwrap_or(0.0);
            let to = vm.local("to").as_number().unwrap_or(0.0);
            let step = match vm.local("step").as_number() {
                Some(s) => s,
                None => {
                    if to >= from {
                        1.0
                    } else {
                        -1.0
                    }
                }
            };
            if step == 0.0 {
                return Err(Error::type_mismatch("range() step must not be zero"));
            }
            let count = ((to - from) / step).floor();
            if count < 0.0 {
                return done(Value::list(Vec::new()));
            }
            let count = count as usize + 1;
            if count > MAX_LIST_SIZE {
                return Err(Error::limit_exceeded("range() result too large"));
            }
            let mut items = Vec::with_capacity(count);
            for i in 0..count {
                items.push(Value::Number(from + step * i as f64));
            }
            done(Value::list(items))
        }),
    );

    reg.register(
        IntrinsicSpec::new("slice")
            .param("seq", Value::Null)
            .param("from", 0)
            .param("to", Value::Null),
        Rc::new(|vm, _| {
            let seq = vm.local("seq");
            let from = vm.local("from").as_number();
            let to = vm.local("to").as_number();
            match &seq {
                Value::List(l) => {
                    let l = l.borrow();
                    let a = slice_bound(from, l.len(), 0);
                    let b = slice_bound(to, l.len(), l.len());
                    let items = if a < b { l[a..b].to_vec() } else { Vec::new() };
                    done(Value::list(items))
                }
                Value::Str(s) => {
                    let chars: Vec<char> = s.chars().collect();
                    let a = slice_bound(from, chars.len(), 0);
                    let b = slice_bound(to, chars.len(), chars.len());
                    let out: String = if a < b {
                        chars[a..b].iter().collect()
                    } else {
                        String::new()
                    };
                    done(Value::from(out))
                }
                _ => done(Value::Null),
            }
        }),
    );

    reg.register(
        IntrinsicSpec::new("indexOf")
            .param("self", Value::Null)
            .param("value", Value::Null)
            .param("after", Value::Null),
        Rc::new(|vm, _| {
            let v = vm.local("self");
            let target = vm.local("value");
            let after = vm.local("after").as_number();
            match &v {
                Value::List(l) => {
                    let l = l.borrow();
                    let start = match after {
                        Some(a) => {
                            let mut i = a.trunc() as i64;
                            if i < 0 {
                                i += l.len() as i64;
                            }
                            (i + 1).max(0) as usize
                        }
                        None => 0,
                    };
                    for (i, item) in l.iter().enumerate().skip(start) {
                        if item.equality(&target, RECURSION_DEPTH) >= 1.0 {
                            return done(Value::from(i));
                        }
                    }
                    done(Value::Null)
                }
                Value::Str(s) => {
                    let Some(needle) = target.as_str() else {
                        return done(Value::Null);
                    };
                    let chars: Vec<char> = s.chars().collect();
                    let start = match after {
                        Some(a) => {
                            let mut i = a.trunc() as i64;
                            if i < 0 {
                                i += chars.len() as i64;
                            }
                            (i + 1).max(0) as usize
                        }
                        None => 0,
                    };
                    let hay: String = chars.iter().skip(start).collect();
                    match hay.find(needle) {
                        Some(byte_idx) => {
                            let char_idx = hay[..byte_idx].chars().count();
                            done(Value::from(start + char_idx))
                        }
                        None => done(Value::Null),
                    }
                }
                Value::Map(m) => {
                    for (k, item) in m.borrow().iter() {
                        if item.equality(&target, RECURSION_DEPTH) >= 1.0 {
                            return done(k.clone());
                        }
                    }
                    done(Value::Null)
                }
                _ => done(Value::Null),
            }
        }),
    );

    reg.register(
        IntrinsicSpec::new("hasIndex")
            .param("self", Value::Null)
            .param("index", Value::Null),
        Rc::new(|vm, _| {
            let v = vm.local("self");
            let index = vm.local("index");
            let has = match &v {
                Value::List(l) => match index.as_number() {
                    Some(n) => {
                        let len = l.borrow().len() as i64;
                        n == n.trunc() && (n as i64) >= -len && (n as i64) < len
                    }
                    None => false,
                },
                Value::Str(s) => match index.as_number() {
                    Some(n) => {
                        let len = s.chars().count() as i64;
                        n == n.trunc() && (n as i64) >= -len && (n as i64) < len
                    }
                    None => false,
                },
                Value::Map(m) => m.borrow().contains(&index),
                _ => false,
            };
            done(Value::from(has))
        }),
    );

    reg.register(
        IntrinsicSpec::new("indexes").param("self", Value::Null),
        Rc::new(|vm, _| {
            let v = vm.local("self");
            match &v {
                Value::Map(m) => done(Value::list(m.borrow().keys().cloned().collect())),
                Value::List(l) => {
                    let n = l.borrow().len();
                    done(Value::list((0..n).map(Value::from).collect()))
                }
                Value::Str(s) => {
                    let n = s.chars().count();
                    done(Value::list((0..n).map(Value::from).collect()))
                }
                _ => done(Value::Null),
            }
        }),
    );

    reg.register(
        IntrinsicSpec::new("values").param("self", Value::Null),
        Rc::new(|vm, _| {
            let v = vm.local("self");
            match &v {
                Value::Map(m) => done(Value::list(m.borrow().values().cloned().collect())),
                Value::List(l) => done(Value::list(l.borrow().clone())),
                Value::Str(s) => done(Value::list(
                    s.chars().map(|c| Value::from(c.to_string())).collect(),
                )),
                _ => done(v),
            }
        }),
    );

    reg.register(
        IntrinsicSpec::new("insert")
            .param("self", Value::Null)
            .param("index", Value::Null)
            .param("value", Value::Null),
        Rc::new(|vm, _| {
            let v = vm.local("self");
            let index = vm.local("index");
            let value = vm.local("value");
            match &v {
                Value::List(l) => {
                    let n = index
                        .as_number()
                        .ok_or_else(|| Error::type_mismatch("insert: index must be a number"))?;
                    let len = l.borrow().len();
                    if len >= MAX_LIST_SIZE {
                        return Err(Error::limit_exceeded("list too large"));
                    }
                    let i = insert_index(n, len)?;
                    l.borrow_mut().insert(i, value);
                    done(v)
                }
                Value::Str(s) => {
                    let n = index
                        .as_number()
                        .ok_or_else(|| Error::type_mismatch("insert: index must be a number"))?;
                    let chars: Vec<char> = s.chars().collect();
                    let i = insert_index(n, chars.len())?;
                    let mut out: String = chars[..i].iter().collect();
                    out.push_str(&value.to_display_string());
                    out.extend(&chars[i..]);
                    done(Value::from(out))
                }
                _ => Err(Error::type_mismatch(
                    "Type Error: insert requires a list or string",
                )),
            }
        }),
    );

    reg.register(
        IntrinsicSpec::new("remove")
            .param("self", Value::Null)
            .param("k", Value::Null),
        Rc::new(|vm, _| {
            let v = vm.local("self");
            let k = vm.local("k");
            match &v {
                Value::List(l) => {
                    let n = k
                        .as_number()
                        .ok_or_else(|| Error::type_mismatch("remove: index must be a number"))?;
                    let len = l.borrow().len();
                    let i = crate::value::normalize_index(n, len)?;
                    l.borrow_mut().remove(i);
                    done(Value::Null)
                }
                Value::Map(m) => {
                    let removed = m.borrow_mut().remove(&k).is_some();
                    done(Value::from(removed))
                }
                Value::Str(s) => {
                    let needle = k.to_display_string();
                    done(Value::from(s.replacen(&needle, "", 1)))
                }
                _ => Err(Error::type_mismatch(
                    "Type Error: remove requires a list, map, or string",
                )),
            }
        }),
    );

    reg.register(
        IntrinsicSpec::new("push")
            .param("self", Value::Null)
            .param("value", Value::Null),
        Rc::new(|vm, _| {
            let v = vm.local("self");
            let value = vm.local("value");
            match &v {
                Value::List(l) => {
                    if l.borrow().len() >= MAX_LIST_SIZE {
                        return Err(Error::limit_exceeded("list too large"));
                    }
                    l.borrow_mut().push(value);
                    done(v)
                }
                Value::Map(m) => {
                    m.borrow_mut().insert(value, Value::one());
                    done(v)
                }
                _ => Err(Error::type_mismatch("Type Error: push requires a list or map")),
            }
        }),
    );

    reg.register(
        IntrinsicSpec::new("pop").param("self", Value::Null),
        Rc::new(|vm, _| {
            let v = vm.local("self");
            match &v {
                Value::List(l) => done(l.borrow_mut().pop().unwrap_or(Value::Null)),
                Value::Map(m) => {
                    let last = m.borrow().len().checked_sub(1).and_then(|i| {
                        m.borrow().get_index(i).map(|(k, _)| k)
                    });
                    match last {
                        Some(key) => {
                            m.borrow_mut().remove(&key);
                            done(key)
                        }
                        None => done(Value::Null),
                    }
                }
                _ => done(Value::Null),
            }
        }),
    );

    reg.register(
        IntrinsicSpec::new("pull").param("self", Value::Null),
        Rc::new(|vm, _| {
            let v = vm.local("self");
            match &v {
                Value::List(l) => {
                    let mut l = l.borrow_mut();
                    if l.is_empty() {
                        done(Value::Null)
                    } else {
                        done(l.remove(0))
                    }
                }
                Value::Map(m) => {
                    let first = m.borrow().get_index(0).map(|(k, _)| k);
                    match first {
                        Some(key) => {
                            m.borrow_mut().remove(&key);
                            done(key)
                        }
                        None => done(Value::Null),
                    }
                }
                _ => done(Value::Null),
            }
        }),
    );

    reg.register(
        IntrinsicSpec::new("sort")
            .param("self", Value::Null)
            .param("byKey", Value::Null),
        Rc::new(|vm, _| {
            let v = vm.local("self");
            let by_key = vm.local("byKey");
            if let Value::List(l) = &v {
                if matches!(by_key, Value::Null) {
                    l.borrow_mut().sort_by(|a, b| a.compare(b));
                } else {
                    l.borrow_mut()
                        .sort_by(|a, b| sort_key(a, &by_key).compare(&sort_key(b, &by_key)));
                }
            }
            done(v)
        }),
    );

    reg.register(
        IntrinsicSpec::new("shuffle").param("self", Value::Null),
        Rc::new(|vm, _| {
            let v = vm.local("self");
            if let Value::List(l) = &v {
                let len = l.borrow().len();
                for i in (1..len).rev() {
                    let j = (vm.random() * (i + 1) as f64) as usize;
                    l.borrow_mut().swap(i, j.min(i));
                }
            }
            done(v)
        }),
    );

    reg.register(
        IntrinsicSpec::new("sum").param("self", Value::Null),
        Rc::new(|vm, _| {
            let v = vm.local("self");
            let total: f64 = match &v {
                Value::List(l) => l
                    .borrow()
                    .iter()
                    .filter_map(|x| x.as_number())
                    .sum(),
                Value::Map(m) => m
                    .borrow()
                    .values()
                    .filter_map(|x| x.as_number())
                    .sum(),
                _ => 0.0,
            };
            done(Value::Number(total))
        }),
    );

    reg.register(
        IntrinsicSpec::new("join")
            .param("self", Value::Null)
            .param("delimiter", " "),
        Rc::new(|vm, _| {
            let v = vm.local("self");
            let delim = vm.local("delimiter").to_display_string();
            match &v {
                Value::List(l) => {
                    let parts: Vec<String> =
                        l.borrow().iter().map(|x| x.to_display_string()).collect();
                    done(Value::from(parts.join(&delim)))
                }
                _ => done(v),
            }
        }),
    );

    reg.register(
        IntrinsicSpec::new("split")
            .param("self", "")
            .param("delimiter", " "),
        Rc::new(|vm, _| {
            let v = vm.local("self");
            let delim = vm.local("delimiter").to_display_string();
            let Some(s) = v.as_str() else {
                return done(Value::Null);
            };
            let parts: Vec<Value> = if delim.is_empty() {
                s.chars().map(|c| Value::from(c.to_string())).collect()
            } else {
                s.split(delim.as_str()).map(Value::from).collect()
            };
            done(Value::list(parts))
        }),
    );

    reg.register(
        IntrinsicSpec::new("replace")
            .param("self", Value::Null)
            .param("oldval", Value::Null)
            .param("newval", Value::Null),
        Rc::new(|vm, _| {
            let v = vm.local("self");
            let oldval = vm.local("oldval");
            let newval = vm.local("newval");
            match &v {
                Value::Str(s) => {
                    let old = oldval.to_display_string();
                    if old.is_empty() {
                        return done(v);
                    }
                    let new = newval.to_display_string();
                    done(Value::from(s.replace(&old, &new)))
                }
                Value::List(l) => {
                    for item in l.borrow_mut().iter_mut() {
                        if item.equality(&oldval, RECURSION_DEPTH) >= 1.0 {
                            *item = newval.clone();
                        }
                    }
                    done(v)
                }
                Value::Map(m) => {
                    let keys: Vec<Value> = m
                        .borrow()
                        .iter()
                        .filter(|(_, val)| val.equality(&oldval, RECURSION_DEPTH) >= 1.0)
                        .map(|(k, _)| k.clone())
                        .collect();
                    for k in keys {
                        m.borrow_mut().insert(k, newval.clone());
                    }
                    done(v)
                }
                _ => done(v),
            }
        }),
    );

    reg.register(
        IntrinsicSpec::new("upper").param("self", ""),
        Rc::new(|vm, _| {
            let v = vm.local("self");
            match v.as_str() {
                Some(s) => done(Value::from(s.to_uppercase())),
                None => done(v),
            }
        }),
    );

    reg.register(
        IntrinsicSpec::new("lower").param("self", ""),
        Rc::new(|vm, _| {
            let v = vm.local("self");
            match v.as_str() {
                Some(s) => done(Value::from(s.to_lowercase())),
                None => done(v),
            }
        }),
    );
}

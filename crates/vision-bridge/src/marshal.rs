//! Conversion between Lua values and [`NativeValue`].
//!
//! Lua has one table type where the native side distinguishes sequences
//! from mappings, so tables are classified by their keys:
//!
//! | keys                         | native value        |
//! |------------------------------|---------------------|
//! | none                         | empty `Map`         |
//! | integers exactly `1..=n`     | `Array`             |
//! | strings                      | `Map`               |
//! | anything else                | `MarshalError`      |
//!
//! Tables built from a native `Array` carry a shared metatable named
//! `NativeArray`, so an empty array stays an array on the way back.
//!
//! `Null` is `nil` at the top level and the null light userdata
//! ([`Value::NULL`]) inside arrays and maps, where `nil` would erase the
//! slot. Both convert back to `Null`. Functions, coroutines and foreign
//! userdata are rejected rather than dropped.

use crate::buffer_cache::{ArrayBufferObject, BufferCache};
use crate::error::MarshalError;
use crate::value::{NativeMap, NativeValue};
use mlua::{Lua, Table, Value};

/// Deepest table nesting accepted from Lua; cyclic tables hit this bound.
pub const MAX_DEPTH: usize = 64;

/// `__name` of the metatable marking tables that hold a native array.
pub const ARRAY_TYPE_NAME: &str = "NativeArray";

const ARRAY_METATABLE_KEY: &str = "vision_bridge.array_metatable";

/// The per-state metatable given to tables built from native arrays.
fn array_metatable(lua: &Lua) -> mlua::Result<Table<'_>> {
    if let Some(metatable) = lua.named_registry_value::<Option<Table>>(ARRAY_METATABLE_KEY)? {
        return Ok(metatable);
    }
    let metatable = lua.create_table()?;
    metatable.raw_set("__name", ARRAY_TYPE_NAME)?;
    lua.set_named_registry_value(ARRAY_METATABLE_KEY, metatable.clone())?;
    Ok(metatable)
}

fn is_marked_array(table: &Table<'_>) -> bool {
    table.get_metatable().is_some_and(|metatable| {
        matches!(
            metatable.raw_get::<_, Option<String>>("__name"),
            Ok(Some(name)) if name == ARRAY_TYPE_NAME
        )
    })
}

/// Convert a Lua value into the native object model.
pub fn lua_to_native(value: &Value<'_>) -> Result<NativeValue, MarshalError> {
    to_native(value, 0)
}

/// Convert a Lua table that must describe a string-keyed mapping.
pub fn lua_table_to_map(table: &Table<'_>) -> Result<NativeMap, MarshalError> {
    match table_to_native(table, 0)? {
        NativeValue::Map(map) => Ok(map),
        other => Err(MarshalError::ExpectedMap(if other.as_array().is_some() {
            "sequence"
        } else {
            other.type_name()
        })),
    }
}

fn to_native(value: &Value<'_>, depth: usize) -> Result<NativeValue, MarshalError> {
    match value {
        Value::Nil => Ok(NativeValue::Null),
        Value::LightUserData(ud) if ud.0.is_null() => Ok(NativeValue::Null),
        Value::Boolean(b) => Ok(NativeValue::Bool(*b)),
        Value::Integer(i) => Ok(NativeValue::Int(*i)),
        Value::Number(n) => Ok(NativeValue::Double(*n)),
        Value::String(s) => s
            .to_str()
            .map(|s| NativeValue::String(s.to_owned()))
            .map_err(|_| MarshalError::InvalidUtf8),
        Value::Table(table) => table_to_native(table, depth),
        Value::UserData(ud) => match ud.borrow::<ArrayBufferObject>() {
            Ok(wrapper) => Ok(NativeValue::Buffer(wrapper.buffer().clone())),
            Err(_) => Err(MarshalError::Unsupported("userdata")),
        },
        other => Err(MarshalError::Unsupported(other.type_name())),
    }
}

fn table_to_native(table: &Table<'_>, depth: usize) -> Result<NativeValue, MarshalError> {
    if depth >= MAX_DEPTH {
        return Err(MarshalError::TooDeep(MAX_DEPTH));
    }

    let mut indexed: Vec<(i64, Value<'_>)> = Vec::new();
    let mut named: Vec<(String, Value<'_>)> = Vec::new();

    for pair in table.clone().pairs::<Value, Value>() {
        let (key, value) = pair.map_err(|err| MarshalError::Engine(err.to_string()))?;
        match key {
            Value::Integer(i) => indexed.push((i, value)),
            Value::String(s) => {
                let key = s.to_str().map_err(|_| MarshalError::InvalidUtf8)?;
                named.push((key.to_owned(), value));
            }
            other => return Err(MarshalError::NonStringKey(other.type_name())),
        }
    }

    let marked = is_marked_array(table);
    match (indexed.is_empty(), named.is_empty()) {
        (true, true) if marked => Ok(NativeValue::Array(Vec::new())),
        (true, _) if !marked => {
            let mut map = NativeMap::new();
            for (key, value) in named {
                map.insert(key, to_native(&value, depth + 1)?);
            }
            Ok(NativeValue::Map(map))
        }
        (false, true) => {
            indexed.sort_unstable_by_key(|(index, _)| *index);
            let is_sequence = indexed
                .iter()
                .enumerate()
                .all(|(position, (index, _))| usize::try_from(*index).ok() == Some(position + 1));
            if !is_sequence {
                return Err(MarshalError::MixedTable);
            }
            indexed
                .iter()
                .map(|(_, value)| to_native(value, depth + 1))
                .collect::<Result<Vec<_>, _>>()
                .map(NativeValue::Array)
        }
        _ => Err(MarshalError::MixedTable),
    }
}

/// Convert a native value into a Lua value owned by `lua`.
///
/// Buffers go through `buffers`, so the same buffer shows up as the same
/// wrapper within one execution context. A top-level `Null` is `nil`.
pub fn native_to_lua<'lua>(
    lua: &'lua Lua,
    value: &NativeValue,
    buffers: &BufferCache,
) -> mlua::Result<Value<'lua>> {
    Ok(match value {
        NativeValue::Null => Value::Nil,
        NativeValue::Bool(b) => Value::Boolean(*b),
        NativeValue::Int(i) => Value::Integer(*i),
        NativeValue::Double(d) => Value::Number(*d),
        NativeValue::String(s) => Value::String(lua.create_string(s)?),
        NativeValue::Array(items) => {
            let table = lua.create_table()?;
            for (index, item) in items.iter().enumerate() {
                table.raw_set(index + 1, element_to_lua(lua, item, buffers)?)?;
            }
            table.set_metatable(Some(array_metatable(lua)?));
            Value::Table(table)
        }
        NativeValue::Map(map) => Value::Table(native_map_to_lua(lua, map, buffers)?),
        NativeValue::Buffer(buffer) => Value::UserData(buffers.get_or_create(lua, buffer)?),
    })
}

pub fn native_map_to_lua<'lua>(
    lua: &'lua Lua,
    map: &NativeMap,
    buffers: &BufferCache,
) -> mlua::Result<Table<'lua>> {
    let table = lua.create_table()?;
    for (key, value) in map {
        table.raw_set(key.as_str(), element_to_lua(lua, value, buffers)?)?;
    }
    Ok(table)
}

/// Like [`native_to_lua`], but `Null` keeps its slot as [`Value::NULL`].
fn element_to_lua<'lua>(
    lua: &'lua Lua,
    value: &NativeValue,
    buffers: &BufferCache,
) -> mlua::Result<Value<'lua>> {
    match value {
        NativeValue::Null => Ok(Value::NULL),
        other => native_to_lua(lua, other, buffers),
    }
}

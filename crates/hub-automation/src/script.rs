//! Lua script conditions and actions
//!
//! Each script gets its own Lua state with only the table, string, math,
//! utf8 and coroutine libraries. Chunk loading, raw writes and bytecode
//! dumping are removed, and the global table is frozen once the hub
//! capabilities are installed. The body is compiled once at load time as
//!
//! ```lua
//! return function(runner, setProgress, parents, condition)  -- or action
//!     <body>
//! end
//! ```
//!
//! Capabilities:
//!
//! - `server.name`, `server.version`
//! - `getAccessory(uuid)`, `getService(accessory, service)`
//! - `getCharacteristic(a, s, c)`, `getCharacteristicValue(a, s, c)`
//! - `setCharacteristicValue(a, s, c, value)` (async)
//! - `automations.list()`, `automations.get(uuid)`,
//!   `automations.run(uuid [, skipConditions])` (async)
//! - `log.debug/info/warn/error(message)` and `print(...)`

use hub_core::{AccessoryModel, CharacteristicError, CharacteristicPath};
use mlua::{Function, Lua, LuaOptions, LuaSerdeExt, SerializeOptions, StdLib};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::{Arc, Weak};
use tracing::{debug, error, info, warn};

use crate::context::RunContext;
use crate::error::{AutomationError, AutomationResult};
use crate::events::TriggerEvent;
use crate::group::AutomationGroup;
use crate::progress::Progress;

/// Script body: one string, or a list of lines joined with newlines
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScriptSource {
    Text(String),
    Lines(Vec<String>),
}

impl ScriptSource {
    pub fn text(&self) -> String {
        match self {
            ScriptSource::Text(text) => text.clone(),
            ScriptSource::Lines(lines) => lines.join("\n"),
        }
    }
}

#[derive(Deserialize)]
pub(crate) struct ScriptOptions {
    pub script: ScriptSource,
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum ScriptRole {
    Condition,
    Action,
}

impl ScriptRole {
    fn parameter(self) -> &'static str {
        match self {
            ScriptRole::Condition => "condition",
            ScriptRole::Action => "action",
        }
    }
}

/// Strips unsafe base functions and freezes every global table
const SANDBOX: &str = r##"
local setmetatable, pairs, error, tostring, select, format, concat =
    setmetatable, pairs, error, tostring, select, string.format, table.concat

load, loadfile, dofile, collectgarbage, rawset = nil, nil, nil, nil, nil
string.dump = nil

local info = log.info
print = function(...)
    local parts = {}
    for i = 1, select("#", ...) do
        parts[i] = tostring((select(i, ...)))
    end
    info(concat(parts, "\t"))
end

local function freeze(t, name)
    local entries = {}
    for k, v in pairs(t) do
        entries[k] = v
    end
    for k in pairs(entries) do
        t[k] = nil
    end
    return setmetatable(t, {
        __index = entries,
        __newindex = function(_, key)
            error(format("attempt to modify read-only %s field '%s'", name, tostring(key)), 2)
        end,
        __metatable = false,
    })
end

for _, name in pairs({ "string", "table", "math", "utf8", "coroutine", "server", "automations", "log" }) do
    freeze(_G[name], name)
end
freeze(_G, "global")
"##;

/// A compiled script
pub(crate) struct Script {
    lua: Lua,
    function: Function,
    label: String,
}

impl Script {
    pub(crate) fn compile(
        group: &AutomationGroup,
        label: &str,
        source: &ScriptSource,
        role: ScriptRole,
    ) -> AutomationResult<Script> {
        let lua = Lua::new_with(
            StdLib::TABLE | StdLib::STRING | StdLib::MATH | StdLib::UTF8 | StdLib::COROUTINE,
            LuaOptions::default(),
        )
        .map_err(|e| AutomationError::Config(format!("cannot create Lua state: {}", e)))?;

        install_capabilities(&lua, group, label)
            .and_then(|()| lua.load(SANDBOX).set_name("sandbox").exec())
            .map_err(|e| AutomationError::Config(format!("cannot prepare sandbox: {}", e)))?;

        let wrapped = format!(
            "return function(runner, setProgress, parents, {})\n{}\nend",
            role.parameter(),
            source.text()
        );
        let function = lua
            .load(wrapped)
            .set_name(label)
            .eval::<Function>()
            .map_err(|e| AutomationError::Config(format!("{} failed to compile: {}", label, e)))?;

        debug!(script = %label, "Compiled script");
        Ok(Script {
            lua,
            function,
            label: label.to_string(),
        })
    }

    /// Call the compiled function and convert its result to JSON
    pub(crate) async fn call(
        &self,
        ctx: &RunContext,
        progress: &Progress,
        parents: Value,
        this: Value,
    ) -> AutomationResult<Value> {
        let lua = &self.lua;
        let progress = progress.clone();
        let set_progress = lua.create_function(move |_, value: f64| {
            progress.set(value).map_err(mlua::Error::external)
        })?;

        let result: mlua::Value = self
            .function
            .call_async((
                to_lua(lua, &ctx.describe())?,
                set_progress,
                to_lua(lua, &parents)?,
                to_lua(lua, &this)?,
            ))
            .await
            .map_err(|e| AutomationError::Script(format!("{}: {}", self.label, e)))?;

        match result {
            mlua::Value::Nil => Ok(Value::Null),
            other => Ok(lua.from_value(other)?),
        }
    }
}

/// Serialize into Lua, with null mapped to nil
fn to_lua<T: Serialize + ?Sized>(lua: &Lua, value: &T) -> mlua::Result<mlua::Value> {
    lua.to_value_with(
        value,
        SerializeOptions::new()
            .serialize_none_to_null(false)
            .serialize_unit_to_null(false),
    )
}

fn install_capabilities(lua: &Lua, group: &AutomationGroup, label: &str) -> mlua::Result<()> {
    let globals = lua.globals();

    let server = lua.create_table()?;
    server.set("name", group.name())?;
    server.set("version", env!("CARGO_PKG_VERSION"))?;
    globals.set("server", server)?;

    install_accessories(lua, group.accessories().clone())?;
    install_automations(lua, group.downgrade())?;
    install_log(lua, label)?;

    Ok(())
}

fn install_accessories(lua: &Lua, accessories: Arc<dyn AccessoryModel>) -> mlua::Result<()> {
    let globals = lua.globals();

    let model = accessories.clone();
    globals.set(
        "getAccessory",
        lua.create_function(move |lua, uuid: String| match model.accessory(&uuid) {
            Some(info) => to_lua(lua, &info),
            None => Ok(mlua::Value::Nil),
        })?,
    )?;

    let model = accessories.clone();
    globals.set(
        "getService",
        lua.create_function(move |lua, (accessory, service): (String, String)| {
            match model.service(&accessory, &service) {
                Some(info) => to_lua(lua, &info),
                None => Ok(mlua::Value::Nil),
            }
        })?,
    )?;

    let model = accessories.clone();
    globals.set(
        "getCharacteristic",
        lua.create_function(move |lua, (a, s, c): (String, String, String)| {
            let path = CharacteristicPath::new(a, s, c);
            match model.characteristic(&path) {
                Some(characteristic) => to_lua(
                    lua,
                    &json!({
                        "accessory": path.accessory,
                        "service": path.service,
                        "uuid": path.characteristic,
                        "value": characteristic.value(),
                    }),
                ),
                None => Ok(mlua::Value::Nil),
            }
        })?,
    )?;

    let model = accessories.clone();
    globals.set(
        "getCharacteristicValue",
        lua.create_function(move |lua, (a, s, c): (String, String, String)| {
            match model.characteristic(&CharacteristicPath::new(a, s, c)) {
                Some(characteristic) => to_lua(lua, &characteristic.value()),
                None => Ok(mlua::Value::Nil),
            }
        })?,
    )?;

    globals.set(
        "setCharacteristicValue",
        lua.create_async_function(
            move |lua, (a, s, c, value): (String, String, String, mlua::Value)| {
                let model = accessories.clone();
                async move {
                    let value: Value = lua.from_value(value)?;
                    let path = CharacteristicPath::new(a, s, c);
                    let characteristic = model.characteristic(&path).ok_or_else(|| {
                        mlua::Error::external(CharacteristicError::NotFound(path.clone()))
                    })?;
                    characteristic
                        .set_value(value)
                        .await
                        .map_err(mlua::Error::external)
                }
            },
        )?,
    )?;

    Ok(())
}

fn install_automations(lua: &Lua, group: Weak<AutomationGroup>) -> mlua::Result<()> {
    let automations = lua.create_table()?;

    let weak = group.clone();
    automations.set(
        "list",
        lua.create_function(move |lua, ()| {
            let list: Vec<Value> = weak
                .upgrade()
                .map(|group| group.automations().iter().map(|a| a.describe()).collect())
                .unwrap_or_default();
            to_lua(lua, &Value::Array(list))
        })?,
    )?;

    let weak = group.clone();
    automations.set(
        "get",
        lua.create_function(move |lua, uuid: String| {
            match weak.upgrade().and_then(|group| group.automation_by_uuid(&uuid)) {
                Some(automation) => to_lua(lua, &automation.describe()),
                None => Ok(mlua::Value::Nil),
            }
        })?,
    )?;

    automations.set(
        "run",
        lua.create_async_function(move |_, (uuid, skip_conditions): (String, Option<bool>)| {
            let group = group.clone();
            async move {
                let Some(automation) = group.upgrade().and_then(|g| g.automation_by_uuid(&uuid))
                else {
                    return Ok(None);
                };
                let event = TriggerEvent::manual(json!({ "source": "script" }));
                let runner = if skip_conditions.unwrap_or(false) {
                    automation.runner_without_conditions(event)
                } else {
                    automation.runner(event)
                };
                runner.run().await.map(Some).map_err(mlua::Error::external)
            }
        })?,
    )?;

    lua.globals().set("automations", automations)
}

fn install_log(lua: &Lua, label: &str) -> mlua::Result<()> {
    let log = lua.create_table()?;

    let script = label.to_string();
    log.set(
        "debug",
        lua.create_function(move |_, message: String| {
            debug!(script = %script, "{}", message);
            Ok(())
        })?,
    )?;
    let script = label.to_string();
    log.set(
        "info",
        lua.create_function(move |_, message: String| {
            info!(script = %script, "{}", message);
            Ok(())
        })?,
    )?;
    let script = label.to_string();
    log.set(
        "warn",
        lua.create_function(move |_, message: String| {
            warn!(script = %script, "{}", message);
            Ok(())
        })?,
    )?;
    let script = label.to_string();
    log.set(
        "error",
        lua.create_function(move |_, message: String| {
            error!(script = %script, "{}", message);
            Ok(())
        })?,
    )?;

    lua.globals().set("log", log)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{test_group, test_group_with, test_runner};
    use hub_core::MemoryAccessoryModel;

    fn compile(group: &AutomationGroup, body: &str) -> AutomationResult<Script> {
        Script::compile(
            group,
            "test script",
            &ScriptSource::Text(body.to_string()),
            ScriptRole::Action,
        )
    }

    async fn eval(group: &Arc<AutomationGroup>, body: &str) -> AutomationResult<Value> {
        let script = compile(group, body)?;
        let ctx = RunContext::Runner(test_runner(group));
        script.call(&ctx, &Progress::noop(), json!([]), json!({})).await
    }

    #[test]
    fn test_source_lines_are_joined() {
        let source: ScriptSource =
            serde_json::from_value(json!(["local x = 1", "return x"])).unwrap();
        assert_eq!(source.text(), "local x = 1\nreturn x");
    }

    #[test]
    fn test_syntax_error_is_config_error() {
        let group = test_group();
        assert!(matches!(
            compile(&group, "return (("),
            Err(AutomationError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_returns_json() {
        let group = test_group();
        let value = eval(&group, "return { answer = 42, name = server.name }")
            .await
            .unwrap();
        assert_eq!(value, json!({"answer": 42, "name": "test"}));
    }

    #[tokio::test]
    async fn test_globals_are_frozen() {
        let group = test_group();
        assert!(matches!(
            eval(&group, "leaked = true").await,
            Err(AutomationError::Script(_))
        ));
        assert!(eval(&group, "string.upper = nil").await.is_err());
        assert!(eval(&group, "local x = 1; return x").await.is_ok());
    }

    #[tokio::test]
    async fn test_print_accepts_mixed_arguments() {
        let group = test_group();
        let value = eval(&group, "print('lamp', 1, nil, true) return select('#', 1, 2)")
            .await
            .unwrap();
        assert_eq!(value, json!(2));
    }

    #[tokio::test]
    async fn test_unsafe_functions_removed() {
        let group = test_group();
        let value = eval(
            &group,
            "return { load == nil, rawset == nil, string.dump == nil, os == nil, io == nil }",
        )
        .await
        .unwrap();
        assert_eq!(value, json!([true, true, true, true, true]));
    }

    #[tokio::test]
    async fn test_characteristic_access() {
        let accessories = Arc::new(MemoryAccessoryModel::new());
        accessories.add_characteristic(
            CharacteristicPath::new("lamp", "light", "on"),
            json!(false),
            true,
        );
        let group = test_group_with(accessories.clone());

        let value = eval(
            &group,
            r#"
            setCharacteristicValue("lamp", "light", "on", true)
            return getCharacteristicValue("lamp", "light", "on")
            "#,
        )
        .await
        .unwrap();
        assert_eq!(value, json!(true));

        let missing = eval(&group, r#"return getCharacteristic("nope", "x", "y") == nil"#)
            .await
            .unwrap();
        assert_eq!(missing, json!(true));
    }

    #[tokio::test]
    async fn test_progress_is_validated() {
        let group = test_group();
        let result = eval(&group, "setProgress(2)").await;
        assert!(matches!(result, Err(AutomationError::Script(_))));
    }

    #[tokio::test]
    async fn test_runner_is_described() {
        let group = test_group();
        let value = eval(&group, "return runner.kind").await.unwrap();
        assert_eq!(value, json!("runner"));
    }
}

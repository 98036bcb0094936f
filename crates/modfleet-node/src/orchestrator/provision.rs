//! Program Provisioning
//!
//! Turns a stored `ProgramRequest` into the `ModuleSpec` carried by a module
//! create request:
//! 1. identity: caller-supplied for single instantiation/affinity, fresh otherwise
//! 2. variables: session context, node and module ids, then overrides
//! 3. substitution of `${name}` in args, env and channel bindings
//! 4. store path for store-hosted binaries
//! 5. parent pinning for client affinity

use crate::config::SessionVars;
use crate::error::ProvisionError;
use modfleet_core::{parse_canonical_uuid, Affinity, Instantiation, ModuleSpec, ParentRef, ProgramRequest};
use uuid::Uuid;

/// Ordered variable table. A later `set` of an existing name replaces it in place.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VarMap {
    entries: Vec<(String, Option<String>)>,
}

impl VarMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Variables available to a module placed from this node.
    pub fn for_module(session: &SessionVars, node_id: &str, module: &Uuid) -> Self {
        let mut vars = Self::new();
        vars.set("scene", session.scene.clone());
        vars.set("mqtth", session.bus_host.as_deref().map(host_only));
        vars.set("cameraid", session.camera_id.clone());
        vars.set("username", session.username.clone());
        vars.set("runtimeid", Some(node_id.to_string()));
        vars.set("moduleid", Some(module.to_string()));
        for (name, value) in &session.overrides {
            vars.set(name, Some(value.clone()));
        }
        vars
    }

    pub fn set(&mut self, name: &str, value: Option<String>) {
        match self.entries.iter_mut().find(|(n, _)| n == name) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((name.to_string(), value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .and_then(|(_, v)| v.as_deref())
    }

    /// Replace placeholders one variable at a time, in table order. Each
    /// variable with a value rewrites every `${name}` in the text produced
    /// so far, so a value may introduce placeholders for variables later in
    /// the table but never for earlier ones. Unset or unknown names are left
    /// as written.
    pub fn substitute(&self, input: &str) -> String {
        let mut text = input.to_string();
        for (name, value) in &self.entries {
            if let Some(value) = value {
                text = text.replace(&format!("${{{name}}}"), value);
            }
        }
        text
    }
}

/// Host part of a bus endpoint: scheme, path and port removed.
fn host_only(endpoint: &str) -> String {
    let without_scheme = endpoint.split_once("://").map_or(endpoint, |(_, rest)| rest);
    let authority = without_scheme.split('/').next().unwrap_or_default();
    match authority.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host.to_string(),
        _ => authority.to_string(),
    }
}

/// Join path segments with `/` and collapse repeated separators. A run that
/// starts the string or follows `:` (as in `file://`) is kept as written.
pub fn join_store_path(parts: &[&str]) -> String {
    let joined = parts.join("/");
    let mut out = String::with_capacity(joined.len());
    let mut prev: Option<char> = None;
    let mut protected = false;
    for c in joined.chars() {
        if c == '/' {
            if prev == Some('/') {
                if !protected {
                    continue;
                }
            } else {
                protected = matches!(prev, None | Some(':'));
            }
        }
        out.push(c);
        prev = Some(c);
    }
    out
}

/// Pick the module identity for a request.
pub fn assign_identity(request: &ProgramRequest) -> Result<Uuid, ProvisionError> {
    let pinned = request.data.instantiate == Instantiation::Single || request.data.affinity == Affinity::Single;
    if pinned {
        Ok(parse_canonical_uuid(&request.object_id)?)
    } else {
        Ok(Uuid::new_v4())
    }
}

/// Node-side inputs to provisioning.
pub struct ProvisionContext<'a> {
    pub node_id: &'a str,
    pub store_root: &'a str,
    pub session: &'a SessionVars,
}

/// Build the module descriptor for a program request.
pub fn plan(request: &ProgramRequest, ctx: &ProvisionContext<'_>) -> Result<ModuleSpec, ProvisionError> {
    let program = &request.data;
    let uuid = assign_identity(request)?;
    let vars = VarMap::for_module(ctx.session, ctx.node_id, &uuid);

    let joined = |items: &[String]| (!items.is_empty()).then(|| vars.substitute(&items.join(" ")));

    let mut channels = program.channels.clone();
    for channel in &mut channels {
        channel.path = vars.substitute(&channel.path);
        channel.params.topic = vars.substitute(&channel.params.topic);
    }

    let filename = if program.filetype.is_store_hosted() {
        join_store_path(&[ctx.store_root, &program.name, &program.filename])
    } else {
        program.filename.clone()
    };

    let parent = (program.affinity == Affinity::Client).then(|| ParentRef {
        uuid: ctx.node_id.to_string(),
    });

    Ok(ModuleSpec {
        uuid,
        name: program.name.clone(),
        filename,
        filetype: program.filetype.clone(),
        parent,
        args: joined(&program.args),
        env: joined(&program.env),
        channels,
        wait_state: false,
        memory: None,
    })
}

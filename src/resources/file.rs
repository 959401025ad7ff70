//! File management resources. These run on the remote and report what they
//! changed; composite operations return a chain of per-step envelopes.

use std::fs::OpenOptions;
use std::io::Write;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::Path;

use nix::unistd::{chown, Gid, Group, Uid, User};

use crate::errors::ExceptionInfo;
use crate::result::ResultRecord;
use crate::value::{Value, ValueMap};

use super::{
    CallContext, Namespace, Operation, ParamDefault, ParamKind, ParamSchema, ParamSpec, Params,
};

pub const NAMESPACE: Namespace = Namespace {
    name: "file",
    ops: &[
        Operation {
            name: "exists",
            schema: PATH_ONLY,
            run: exists,
        },
        Operation {
            name: "file_exists",
            schema: PATH_ONLY,
            run: file_exists,
        },
        Operation {
            name: "dir_exists",
            schema: PATH_ONLY,
            run: dir_exists,
        },
        Operation {
            name: "stat",
            schema: ParamSchema {
                params: &[
                    ParamSpec::required("path", ParamKind::Str),
                    ParamSpec::with_default(
                        "follow_symlinks",
                        ParamKind::Bool,
                        ParamDefault::Bool(false),
                    ),
                ],
                passthrough: false,
            },
            run: stat,
        },
        Operation {
            name: "mkdirs",
            schema: ParamSchema {
                params: &[
                    ParamSpec::required("path", ParamKind::Str),
                    ParamSpec::with_default(
                        "create_mode",
                        ParamKind::Int,
                        ParamDefault::Int(0o750),
                    ),
                    ParamSpec::with_default("exist_ok", ParamKind::Bool, ParamDefault::Bool(false)),
                ],
                passthrough: false,
            },
            run: mkdirs,
        },
        Operation {
            name: "touch",
            schema: ParamSchema {
                params: &[
                    ParamSpec::required("path", ParamKind::Str),
                    ParamSpec::with_default(
                        "create_mode",
                        ParamKind::Int,
                        ParamDefault::Int(0o640),
                    ),
                    ParamSpec::with_default("exist_ok", ParamKind::Bool, ParamDefault::Bool(true)),
                ],
                passthrough: false,
            },
            run: touch,
        },
        Operation {
            name: "get_contents",
            schema: PATH_ONLY,
            run: get_contents,
        },
        Operation {
            name: "put",
            schema: ParamSchema {
                params: &[
                    ParamSpec::required("path", ParamKind::Str),
                    ParamSpec::required("contents", ParamKind::Str),
                    ParamSpec::with_default("mode", ParamKind::Int, ParamDefault::Int(0o600)),
                    ParamSpec::optional("owner", ParamKind::Str),
                    ParamSpec::optional("group", ParamKind::Str),
                    ParamSpec::with_default(
                        "overwrite",
                        ParamKind::Bool,
                        ParamDefault::Bool(false),
                    ),
                ],
                passthrough: false,
            },
            run: put,
        },
    ],
};

const PATH_ONLY: ParamSchema = ParamSchema {
    params: &[ParamSpec::required("path", ParamKind::Str)],
    passthrough: false,
};

fn io_error(err: impl std::fmt::Display) -> ExceptionInfo {
    ExceptionInfo::new("IoError", err)
}

fn bool_fields(key: &str, value: bool) -> ValueMap {
    let mut fields = Value::map();
    fields.insert(key.to_owned(), Value::Bool(value));
    fields
}

/// Whether a file or directory exists on disk.
fn exists(ctx: &CallContext, params: &Params) -> Result<ResultRecord, ExceptionInfo> {
    let path = params.req_str("path")?;
    Ok(ResultRecord::Single(
        ctx.ok(bool_fields("exists", Path::new(path).exists())),
    ))
}

/// Whether a file exists on disk and is a file.
fn file_exists(ctx: &CallContext, params: &Params) -> Result<ResultRecord, ExceptionInfo> {
    let path = params.req_str("path")?;
    Ok(ResultRecord::Single(
        ctx.ok(bool_fields("exists", Path::new(path).is_file())),
    ))
}

/// Whether a directory exists on disk and is a directory.
fn dir_exists(ctx: &CallContext, params: &Params) -> Result<ResultRecord, ExceptionInfo> {
    let path = params.req_str("path")?;
    Ok(ResultRecord::Single(
        ctx.ok(bool_fields("exists", Path::new(path).is_dir())),
    ))
}

/// Stat structure for a file or directory.
fn stat(ctx: &CallContext, params: &Params) -> Result<ResultRecord, ExceptionInfo> {
    let path = params.req_str("path")?;
    let follow = params.opt_bool("follow_symlinks").unwrap_or(false);

    let meta = if follow {
        std::fs::metadata(path)
    } else {
        std::fs::symlink_metadata(path)
    }
    .map_err(io_error)?;

    let mut fields = Value::map();
    let mut st = Value::map();
    st.insert("st_mode".into(), Value::Int(meta.mode() as i64));
    st.insert("st_ino".into(), Value::Int(meta.ino() as i64));
    st.insert("st_dev".into(), Value::Int(meta.dev() as i64));
    st.insert("st_nlink".into(), Value::Int(meta.nlink() as i64));
    st.insert("st_uid".into(), Value::Int(meta.uid() as i64));
    st.insert("st_gid".into(), Value::Int(meta.gid() as i64));
    st.insert("st_size".into(), Value::Int(meta.size() as i64));
    st.insert("st_atime".into(), Value::Int(meta.atime()));
    st.insert("st_mtime".into(), Value::Int(meta.mtime()));
    st.insert("st_ctime".into(), Value::Int(meta.ctime()));
    fields.insert("stat".into(), Value::Map(st));
    Ok(ResultRecord::Single(ctx.ok(fields)))
}

/// Make a directory and all parent directories leading to it.
fn mkdirs(ctx: &CallContext, params: &Params) -> Result<ResultRecord, ExceptionInfo> {
    let path = params.req_str("path")?;
    let mode = params.opt_i64("create_mode").unwrap_or(0o750) as u32;
    let exist_ok = params.opt_bool("exist_ok").unwrap_or(false);

    let target = Path::new(path);
    if target.is_dir() && !exist_ok {
        return Err(ExceptionInfo::new(
            "IoError",
            format!("{path} already exists"),
        ));
    }

    let created = !target.is_dir();
    std::fs::create_dir_all(target).map_err(io_error)?;
    std::fs::set_permissions(target, std::fs::Permissions::from_mode(mode)).map_err(io_error)?;

    Ok(ResultRecord::Single(ctx.ok(bool_fields("changed", created))))
}

/// Create a file at the specified path and apply the requested mode.
fn touch(ctx: &CallContext, params: &Params) -> Result<ResultRecord, ExceptionInfo> {
    let path = params.req_str("path")?;
    let mode = params.opt_i64("create_mode").unwrap_or(0o640) as u32;
    let exist_ok = params.opt_bool("exist_ok").unwrap_or(true);

    let existed = Path::new(path).exists();
    OpenOptions::new()
        .append(true)
        .create(exist_ok)
        .create_new(!exist_ok)
        .open(path)
        .map_err(io_error)?;

    let mut chain = ctx.chain();
    chain.chain(ctx.ok(bool_fields("created", !existed)));
    let mode_updated = update_file_mode(path, mode)?;
    chain.chain(ctx.ok(bool_fields("mode_updated", mode_updated)));

    Ok(ResultRecord::Chain(chain))
}

/// The contents of the file at `path`.
fn get_contents(ctx: &CallContext, params: &Params) -> Result<ResultRecord, ExceptionInfo> {
    let path = params.req_str("path")?;
    let contents = std::fs::read_to_string(path).map_err(io_error)?;
    let mut fields = Value::map();
    fields.insert("contents".into(), contents.into());
    Ok(ResultRecord::Single(ctx.ok(fields)))
}

/// Place contents onto the remote at `path`. Reports each step (write,
/// mode, ownership) as its own envelope in a chain.
fn put(ctx: &CallContext, params: &Params) -> Result<ResultRecord, ExceptionInfo> {
    let path = params.req_str("path")?;
    let contents = params.req_str("contents")?;
    let mode = params.opt_i64("mode").unwrap_or(0o600) as u32;
    let overwrite = params.opt_bool("overwrite").unwrap_or(false);

    debug!("writing {} bytes to path {path}", contents.len());

    let mut file = OpenOptions::new()
        .write(true)
        .truncate(overwrite)
        .create(overwrite)
        .create_new(!overwrite)
        .open(path)
        .map_err(io_error)?;
    file.write_all(contents.as_bytes()).map_err(io_error)?;
    drop(file);

    let mut chain = ctx.chain();
    chain.chain(ctx.ok(bool_fields("written", true)));

    let mode_updated = update_file_mode(path, mode)?;
    chain.chain(ctx.ok(bool_fields("mode_updated", mode_updated)));

    // If owner or group are not set, inherit from the user we're running
    // as.
    let owner = params.opt_str("owner").map(str::to_owned).unwrap_or_else(|| {
        let fallback = Uid::effective().to_string();
        debug!("no owner set, defaulting to {fallback} (for {path})");
        fallback
    });
    let group = params.opt_str("group").map(str::to_owned).unwrap_or_else(|| {
        let fallback = Gid::effective().to_string();
        debug!("no group set, defaulting to {fallback} (for {path})");
        fallback
    });
    let owner_updated = update_file_ownership(path, &owner, &group)?;
    chain.chain(ctx.ok(bool_fields("ownership_updated", owner_updated)));

    Ok(ResultRecord::Chain(chain))
}

/// True if the file mode was updated.
fn update_file_mode(path: &str, mode: u32) -> Result<bool, ExceptionInfo> {
    let meta = std::fs::metadata(path).map_err(io_error)?;
    if meta.mode() & 0o777 != mode {
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).map_err(io_error)?;
        return Ok(true);
    }
    Ok(false)
}

/// True if the file ownership was updated. Owner and group accept either a
/// name or a numeric id.
fn update_file_ownership(path: &str, owner: &str, group: &str) -> Result<bool, ExceptionInfo> {
    let uid = resolve_uid(owner)?;
    let gid = resolve_gid(group)?;

    let meta = std::fs::metadata(path).map_err(io_error)?;
    if meta.uid() != uid.as_raw() || meta.gid() != gid.as_raw() {
        chown(path, Some(uid), Some(gid)).map_err(io_error)?;
        return Ok(true);
    }
    Ok(false)
}

fn resolve_uid(owner: &str) -> Result<Uid, ExceptionInfo> {
    if let Ok(raw) = owner.parse::<u32>() {
        return Ok(Uid::from_raw(raw));
    }
    match User::from_name(owner) {
        Ok(Some(user)) => Ok(user.uid),
        Ok(None) => Err(ExceptionInfo::new(
            "LookupError",
            format!("no such user: {owner}"),
        )),
        Err(e) => Err(io_error(e)),
    }
}

fn resolve_gid(group: &str) -> Result<Gid, ExceptionInfo> {
    if let Ok(raw) = group.parse::<u32>() {
        return Ok(Gid::from_raw(raw));
    }
    match Group::from_name(group) {
        Ok(Some(group)) => Ok(group.gid),
        Ok(None) => Err(ExceptionInfo::new(
            "LookupError",
            format!("no such group: {group}"),
        )),
        Err(e) => Err(io_error(e)),
    }
}

#[cfg(test)]
mod tests {
    use crate::inventory::{HostSpec, Inventory};

    use super::super::lookup;
    use super::*;

    fn ctx() -> CallContext {
        CallContext::new(Inventory::default(), HostSpec::new("test-host"), 1, 0)
    }

    fn validated(op: &str, pairs: &[(&str, &str)]) -> Params {
        let mut given = Value::map();
        for (key, value) in pairs {
            given.insert((*key).to_owned(), Value::from(*value));
        }
        lookup(op).unwrap().schema.validate(op, &given).unwrap()
    }

    #[test]
    fn put_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("motd");
        let target = target.to_str().unwrap();
        let ctx = ctx();

        let record = put(
            &ctx,
            &validated("file.put", &[("path", target), ("contents", "hello")]),
        )
        .unwrap();
        assert!(record.is_success());
        assert_eq!(record.as_list().len(), 3);

        let fetched = get_contents(&ctx, &validated("file.get_contents", &[("path", target)]))
            .unwrap();
        assert_eq!(
            fetched.as_list()[0].get("contents"),
            Some(&Value::from("hello"))
        );
    }

    #[test]
    fn put_refuses_existing_file_without_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("exists");
        std::fs::write(&target, b"old").unwrap();
        let target = target.to_str().unwrap();

        let err = put(
            &ctx(),
            &validated("file.put", &[("path", target), ("contents", "new")]),
        )
        .unwrap_err();
        assert_eq!(err.name, "IoError");
    }

    #[test]
    fn touch_reports_creation_and_mode() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("touched");
        let target = target.to_str().unwrap();

        let record = touch(&ctx(), &validated("file.touch", &[("path", target)])).unwrap();
        let parts = record.as_list();
        assert_eq!(parts[0].get("created"), Some(&Value::Bool(true)));
        let meta = std::fs::metadata(target).unwrap();
        assert_eq!(meta.mode() & 0o777, 0o640);

        let again = touch(&ctx(), &validated("file.touch", &[("path", target)])).unwrap();
        let parts = again.as_list();
        assert_eq!(parts[0].get("created"), Some(&Value::Bool(false)));
        assert_eq!(parts[1].get("mode_updated"), Some(&Value::Bool(false)));
    }

    #[test]
    fn stat_exposes_the_usual_fields() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("stats");
        std::fs::write(&target, b"abc").unwrap();

        let record = stat(
            &ctx(),
            &validated("file.stat", &[("path", target.to_str().unwrap())]),
        )
        .unwrap();
        let outcome = &record.as_list()[0];
        let st = outcome.get("stat").unwrap();
        assert_eq!(st.get("st_size"), Some(&Value::Int(3)));
        assert!(st.get("st_mode").is_some());
    }
}

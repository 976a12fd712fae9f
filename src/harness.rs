//! Python harness generation.
//!
//! The harness wraps user code before execution: it hands the user a
//! restricted builtin namespace (no eval/exec/compile, guarded __import__,
//! scratch-confined open), redirects stdout/stderr into in-process buffers for
//! the duration of the run, auto-captures open matplotlib figures and notable
//! variables afterwards, and always prints exactly one terminating JSON record
//! on the real stdout, whether or not the user code raised.
//!
//! Framing contract with the host: marker lines are single JSON objects with a
//! `type` discriminator (`plot`, `variable`, `variables`); the last line is the
//! `final` record carrying the accumulated stdout/stderr text and the inline
//! plot payloads. User code and the host parser both tolerate arbitrary plain
//! text before the final record.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use std::path::Path;

/// File name the wrapped script is written under inside the scratch
/// directory. Excluded from artifact extraction.
pub const HARNESS_FILE: &str = "__harness__.py";

/// Marker type of the terminating record.
pub const FINAL_RECORD_TYPE: &str = "final";

/// Modules the harness import guard refuses outright. The static validator
/// rejects most of these earlier; this is the in-process backstop.
const BLOCKED_MODULES: &[&str] = &[
    "os",
    "subprocess",
    "multiprocessing",
    "socket",
    "urllib",
    "requests",
    "httpx",
    "aiohttp",
    "http",
    "ctypes",
    "pty",
    "fcntl",
    "shutil",
    "webbrowser",
    "importlib",
];

const TEMPLATE: &str = r#"
import base64 as _pc_b64
import builtins as _pc_builtins
import json as _pc_json
import os as _pc_os
import sys as _pc_sys
import traceback as _pc_traceback
from io import StringIO as _PcStringIO

_PC_USER_CODE = _pc_b64.b64decode("__CODE_B64__").decode("utf-8")
_PC_SCRATCH = _pc_os.path.realpath(_pc_b64.b64decode("__SCRATCH_B64__").decode("utf-8"))
_PC_BLOCKED_MODULES = __BLOCKED_MODULES__
_PC_MAX_PLOTS = 20
_PC_MAX_PLOT_BYTES = 5 * 1024 * 1024
_PC_MAX_PREVIEW = 500

def _pc_blocked(name):
    def _inner(*args, **kwargs):
        raise PermissionError("'%s' is disabled in the sandbox" % name)
    return _inner

_pc_orig_import = _pc_builtins.__import__

def _pc_guarded_import(name, globals=None, locals=None, fromlist=(), level=0):
    if level > 0:
        return _pc_orig_import(name, globals, locals, fromlist, level)
    root = name.split('.')[0]
    if root in _PC_BLOCKED_MODULES:
        raise ImportError("Module '%s' is blocked in the sandbox" % root)
    return _pc_orig_import(name, globals, locals, fromlist, level)

_pc_orig_open = _pc_builtins.open

def _pc_guarded_open(file, mode='r', *args, **kwargs):
    if isinstance(file, int):
        return _pc_orig_open(file, mode, *args, **kwargs)
    path = _pc_os.path.realpath(_pc_os.path.join(_PC_SCRATCH, _pc_os.fspath(file)))
    if path != _PC_SCRATCH and not path.startswith(_PC_SCRATCH + _pc_os.sep):
        raise PermissionError("File access outside the sandbox directory: %r" % file)
    return _pc_orig_open(path, mode, *args, **kwargs)

_pc_restricted_builtins = dict(vars(_pc_builtins))
for _pc_name in ('eval', 'exec', 'compile'):
    _pc_restricted_builtins[_pc_name] = _pc_blocked(_pc_name)
_pc_restricted_builtins['__import__'] = _pc_guarded_import
_pc_restricted_builtins['open'] = _pc_guarded_open

_pc_plots = []

def _pc_setup_matplotlib():
    try:
        import matplotlib
        matplotlib.use('Agg')
        import matplotlib.pyplot as plt
    except Exception:
        return None
    import io as _pc_io
    import uuid as _pc_uuid

    def _pc_capture_figures():
        for num in plt.get_fignums():
            fig = plt.figure(num)
            buf = _pc_io.BytesIO()
            try:
                fig.savefig(buf, format='png', dpi=100, bbox_inches='tight')
            except Exception as e:
                _pc_sys.stderr.write("plot capture failed for figure %s: %s\n" % (num, e))
                continue
            payload = buf.getvalue()
            if len(payload) > _PC_MAX_PLOT_BYTES:
                _pc_sys.stderr.write("plot %s exceeds size limit, skipped\n" % num)
                continue
            meta = {'width': fig.get_figwidth(), 'height': fig.get_figheight()}
            if fig.axes:
                ax = fig.axes[0]
                if ax.get_title():
                    meta['title'] = ax.get_title()
                if ax.get_xlabel():
                    meta['xlabel'] = ax.get_xlabel()
                if ax.get_ylabel():
                    meta['ylabel'] = ax.get_ylabel()
            _pc_plots.append({
                'id': str(_pc_uuid.uuid4()),
                'format': 'png',
                'data': _pc_b64.b64encode(payload).decode('ascii'),
                'metadata': meta,
            })
            while len(_pc_plots) > _PC_MAX_PLOTS:
                _pc_plots.pop(0)
        plt.close('all')

    _pc_orig_show = plt.show
    def _pc_show(*args, **kwargs):
        _pc_capture_figures()
    plt.show = _pc_show

    _pc_orig_savefig = plt.savefig
    def _pc_savefig(fname, *args, **kwargs):
        result = _pc_orig_savefig(fname, *args, **kwargs)
        _pc_capture_figures()
        return result
    plt.savefig = _pc_savefig

    return _pc_capture_figures

def _pc_snapshot_variables(namespace):
    snapshot = {}
    for name, value in list(namespace.items()):
        if name.startswith('_') or callable(value):
            continue
        if type(value).__name__ == 'module':
            continue
        qualified = type(value).__name__
        module = type(value).__module__
        if module not in (None, 'builtins'):
            qualified = module + '.' + qualified
        entry = {'name': name, 'type': qualified}
        shape = getattr(value, 'shape', None)
        if shape is not None:
            try:
                entry['shape'] = [int(d) for d in shape]
            except Exception:
                pass
        dtype = getattr(value, 'dtype', None)
        if dtype is not None:
            entry['dtype'] = str(dtype)
        try:
            _pc_json.dumps(value)
            entry['value'] = value
        except (TypeError, ValueError):
            text = repr(value)
            entry['value'] = None
            if len(text) > _PC_MAX_PREVIEW:
                text = text[:_PC_MAX_PREVIEW] + '...'
            entry['preview'] = text
        try:
            entry['size'] = _pc_sys.getsizeof(value)
        except Exception:
            pass
        snapshot[name] = entry
    return snapshot

_pc_capture_figures = _pc_setup_matplotlib()

_pc_stdout = _PcStringIO()
_pc_stderr = _PcStringIO()
_pc_real_stdout = _pc_sys.stdout
_pc_real_stderr = _pc_sys.stderr
_pc_sys.stdout = _pc_stdout
_pc_sys.stderr = _pc_stderr

_pc_exit_code = 0
_pc_user_globals = {'__name__': '__main__', '__builtins__': _pc_restricted_builtins}
try:
    _pc_code_obj = compile(_PC_USER_CODE, '<sandbox>', 'exec')
    exec(_pc_code_obj, _pc_user_globals)
except SystemExit as _pc_se:
    if isinstance(_pc_se.code, int):
        _pc_exit_code = _pc_se.code
    elif _pc_se.code is not None:
        _pc_stderr.write(str(_pc_se.code) + '\n')
        _pc_exit_code = 1
except BaseException:
    _pc_traceback.print_exc(file=_pc_stderr)
    _pc_exit_code = 1
finally:
    _pc_sys.stdout = _pc_real_stdout
    _pc_sys.stderr = _pc_real_stderr

if _pc_capture_figures is not None:
    try:
        _pc_capture_figures()
    except Exception as _pc_e:
        _pc_stderr.write('plot capture failed: %s\n' % _pc_e)

for _pc_plot in _pc_plots:
    print(_pc_json.dumps({'type': 'plot', 'data': _pc_plot}))

try:
    _pc_variables = _pc_snapshot_variables(_pc_user_globals)
except Exception as _pc_e:
    _pc_variables = {}
    _pc_stderr.write('variable capture failed: %s\n' % _pc_e)

if _pc_variables:
    print(_pc_json.dumps({'type': 'variables', 'data': _pc_variables}, default=str))

print(_pc_json.dumps({
    'type': 'final',
    'stdout': _pc_stdout.getvalue(),
    'stderr': _pc_stderr.getvalue(),
    'exitCode': _pc_exit_code,
    'plots': _pc_plots,
    'variables': _pc_variables,
}, default=str))

_pc_sys.exit(_pc_exit_code)
"#;

/// Build the wrapped Python source for one execution.
///
/// User code and the scratch path are embedded base64-encoded so arbitrary
/// source text never interacts with Python string escaping.
pub fn build_harness(code: &str, scratch_dir: &Path) -> String {
    let blocked = format!(
        "{{{}}}",
        BLOCKED_MODULES
            .iter()
            .map(|m| format!("'{m}'"))
            .collect::<Vec<_>>()
            .join(", ")
    );

    TEMPLATE
        .replace("__CODE_B64__", &BASE64.encode(code.as_bytes()))
        .replace(
            "__SCRATCH_B64__",
            &BASE64.encode(scratch_dir.to_string_lossy().as_bytes()),
        )
        .replace("__BLOCKED_MODULES__", &blocked)
}

//! WGSL source templates.
//!
//! Shader text is generated per specialization with the structural
//! constants (shapes, packing flags) embedded as WGSL constants; per-call
//! scalars travel in a uniform buffer so they never force a recompile.
//! The compiled pipeline is cached by [`super::context::WgpuContext`]
//! keyed on the signature string the kernel builds from the same
//! constants.

use crate::kernels::dropout::WGSL_DROPOUT;

/// Negative infinity; WGSL has no literal for it.
const NEG_INF: &str = "bitcast<f32>(0xff800000u)";

pub fn qkv(b: usize, t: usize, c: usize, heads: usize) -> String {
    let dh = c / heads;
    format!(
        r#"
const B: u32 = {b}u;
const T: u32 = {t}u;
const C: u32 = {c}u;
const H: u32 = {heads}u;
const DH: u32 = {dh}u;

@group(0) @binding(0) var<storage, read> x: array<f32>;
@group(0) @binding(1) var<storage, read> kern: array<f32>;
@group(0) @binding(2) var<storage, read_write> q: array<f32>;
@group(0) @binding(3) var<storage, read_write> k: array<f32>;
@group(0) @binding(4) var<storage, read_write> v: array<f32>;

@compute @workgroup_size(256)
fn main(@builtin(global_invocation_id) gid: vec3<u32>) {{
    let idx = gid.x;
    if (idx >= B * T * 3u * C) {{
        return;
    }}
    let j = idx % (3u * C);
    let bt = idx / (3u * C);
    let ti = bt % T;
    let bi = bt / T;

    var acc = 0.0;
    for (var ci = 0u; ci < C; ci++) {{
        acc += x[(bi * T + ti) * C + ci] * kern[ci * 3u * C + j];
    }}

    let part = j / C;
    let within = j % C;
    let head = within / DH;
    let d = within % DH;
    let out = ((bi * H + head) * T + ti) * DH + d;
    if (part == 0u) {{
        q[out] = acc;
    }} else if (part == 1u) {{
        k[out] = acc;
    }} else {{
        v[out] = acc;
    }}
}}
"#
    )
}

/// One thread per (batch, head, time) row. Packed rows rotate whole lanes
/// since an adjacent coordinate pair is exactly one storage lane.
pub fn rope(b: usize, h: usize, t: usize, d: usize, half: usize, tcols: usize, packed: bool) -> String {
    let lanes = d.div_ceil(2);
    let body = if packed {
        format!(
            r#"
    let base = row * {lanes}u;
    for (var i = 0u; i < {lanes}u; i++) {{
        let lane = x[base + i];
        if (i < HALF) {{
            let pair = unpack2x16float(lane);
            let c = cos_t[pos * TCOLS + i];
            let s = sin_t[pos * TCOLS + i];
            let r0 = pair.x * c - pair.y * s;
            let r1 = pair.x * s + pair.y * c;
            y[base + i] = pack2x16float(vec2<f32>(r0, r1));
        }} else {{
            y[base + i] = lane;
        }}
    }}"#
        )
    } else {
        format!(
            r#"
    let base = row * {d}u;
    for (var i = 0u; i < HALF; i++) {{
        let c = cos_t[pos * TCOLS + i];
        let s = sin_t[pos * TCOLS + i];
        let x0 = x[base + 2u * i];
        let x1 = x[base + 2u * i + 1u];
        y[base + 2u * i] = x0 * c - x1 * s;
        y[base + 2u * i + 1u] = x0 * s + x1 * c;
    }}
    for (var i = 2u * HALF; i < {d}u; i++) {{
        y[base + i] = x[base + i];
    }}"#
        )
    };
    let elem = if packed { "u32" } else { "f32" };
    format!(
        r#"
const ROWS: u32 = {rows}u;
const T: u32 = {t}u;
const HALF: u32 = {half}u;
const TCOLS: u32 = {tcols}u;

struct Params {{
    past_len: u32,
    pad0: u32,
    pad1: u32,
    pad2: u32,
}}

@group(0) @binding(0) var<storage, read> x: array<{elem}>;
@group(0) @binding(1) var<storage, read> sin_t: array<f32>;
@group(0) @binding(2) var<storage, read> cos_t: array<f32>;
@group(0) @binding(3) var<storage, read_write> y: array<{elem}>;
@group(0) @binding(4) var<uniform> params: Params;

@compute @workgroup_size(256)
fn main(@builtin(global_invocation_id) gid: vec3<u32>) {{
    let row = gid.x;
    if (row >= ROWS) {{
        return;
    }}
    let pos = row % T + params.past_len;
{body}
}}
"#,
        rows = b * h * t,
    )
}

pub fn attention_scores(b: usize, h: usize, t1: usize, t2: usize, d: usize) -> String {
    format!(
        r#"
const ROWS: u32 = {rows}u;
const T1: u32 = {t1}u;
const T2: u32 = {t2}u;
const D: u32 = {d}u;

struct Params {{
    scale: f32,
    past_len: u32,
    pad0: u32,
    pad1: u32,
}}

@group(0) @binding(0) var<storage, read> q: array<f32>;
@group(0) @binding(1) var<storage, read> k: array<f32>;
@group(0) @binding(2) var<storage, read_write> scores: array<f32>;
@group(0) @binding(3) var<uniform> params: Params;

@compute @workgroup_size(256)
fn main(@builtin(global_invocation_id) gid: vec3<u32>) {{
    let row = gid.x;
    if (row >= ROWS) {{
        return;
    }}
    let i = row % T1;
    let bh = row / T1;
    let q_base = (bh * T1 + i) * D;
    let out_base = row * T2;
    for (var j = 0u; j < T2; j++) {{
        if (j > i + params.past_len) {{
            scores[out_base + j] = {NEG_INF};
        }} else {{
            let k_base = (bh * T2 + j) * D;
            var acc = 0.0;
            for (var di = 0u; di < D; di += 4u) {{
                acc += q[q_base + di] * k[k_base + di]
                     + q[q_base + di + 1u] * k[k_base + di + 1u]
                     + q[q_base + di + 2u] * k[k_base + di + 2u]
                     + q[q_base + di + 3u] * k[k_base + di + 3u];
            }}
            scores[out_base + j] = acc * params.scale;
        }}
    }}
}}
"#,
        rows = b * h * t1,
    )
}

/// Softmax over the trailing axis, one thread per row, with the shared
/// deterministic dropout hash. Packed rows read/write whole lanes; the
/// odd-tail padding half never contributes to the max or the sum.
pub fn fused_softmax(rows: usize, c: usize, packed: bool) -> String {
    let (load, store) = if packed {
        (
            "fn load(base: u32, j: u32) -> f32 {
    let pair = unpack2x16float(x[base + j / 2u]);
    if (j % 2u == 0u) { return pair.x; }
    return pair.y;
}",
            "fn store_row(base: u32) {
    for (var l = 0u; l < LANES; l++) {
        let j0 = 2u * l;
        let j1 = 2u * l + 1u;
        var v0 = scratch[j0];
        var v1 = 0.0;
        if (j1 < C) { v1 = scratch[j1]; }
        y[base + l] = pack2x16float(vec2<f32>(v0, v1));
    }
}",
        )
    } else {
        (
            "fn load(base: u32, j: u32) -> f32 {
    return x[base + j];
}",
            "fn store_row(base: u32) {
    for (var j = 0u; j < C; j++) {
        y[base + j] = scratch[j];
    }
}",
        )
    };
    let elem = if packed { "u32" } else { "f32" };
    let lanes = c.div_ceil(2);
    let base_expr = if packed { "row * LANES" } else { "row * C" };
    format!(
        r#"
const ROWS: u32 = {rows}u;
const C: u32 = {c}u;
const LANES: u32 = {lanes}u;
struct Params {{
    rate: f32,
    seed: u32,
    pad0: u32,
    pad1: u32,
}}

@group(0) @binding(0) var<storage, read> x: array<{elem}>;
@group(0) @binding(1) var<storage, read_write> y: array<{elem}>;
@group(0) @binding(2) var<uniform> params: Params;

{WGSL_DROPOUT}

var<private> scratch: array<f32, {c}>;

{load}

{store}

@compute @workgroup_size(64)
fn main(@builtin(global_invocation_id) gid: vec3<u32>) {{
    let row = gid.x;
    if (row >= ROWS) {{
        return;
    }}
    let base = {base_expr};

    var max_v = {NEG_INF};
    for (var j = 0u; j < C; j++) {{
        max_v = max(max_v, load(base, j));
    }}
    if (max_v == {NEG_INF}) {{
        for (var j = 0u; j < C; j++) {{
            scratch[j] = 0.0;
        }}
        store_row(base);
        return;
    }}

    var sum = 0.0;
    for (var j = 0u; j < C; j++) {{
        let e = exp(load(base, j) - max_v);
        scratch[j] = e;
        sum += e;
    }}
    let inv = 1.0 / sum;
    for (var j = 0u; j < C; j++) {{
        var p = scratch[j] * inv;
        if (params.rate > 0.0) {{
            p *= dropout_scale(row * C + j, params.seed, params.rate);
        }}
        scratch[j] = p;
    }}
    store_row(base);
}}
"#
    )
}

pub fn rms_norm(rows: usize, c: usize, packed: bool) -> String {
    let elem = if packed { "u32" } else { "f32" };
    let lanes = c.div_ceil(2);
    let base_expr = if packed { "row * LANES" } else { "row * C" };
    let (load, store) = if packed {
        (
            "fn load(base: u32, j: u32) -> f32 {
    let pair = unpack2x16float(x[base + j / 2u]);
    if (j % 2u == 0u) { return pair.x; }
    return pair.y;
}",
            "    for (var l = 0u; l < LANES; l++) {
        let j0 = 2u * l;
        let j1 = 2u * l + 1u;
        var v0 = load(base, j0) * r * gamma[j0];
        var v1 = 0.0;
        if (j1 < C) { v1 = load(base, j1) * r * gamma[j1]; }
        y[base + l] = pack2x16float(vec2<f32>(v0, v1));
    }",
        )
    } else {
        (
            "fn load(base: u32, j: u32) -> f32 {
    return x[base + j];
}",
            "    for (var j = 0u; j < C; j++) {
        y[base + j] = load(base, j) * r * gamma[j];
    }",
        )
    };
    format!(
        r#"
const ROWS: u32 = {rows}u;
const C: u32 = {c}u;
const LANES: u32 = {lanes}u;
const EPS: f32 = 1e-8;

@group(0) @binding(0) var<storage, read> x: array<{elem}>;
@group(0) @binding(1) var<storage, read> gamma: array<f32>;
@group(0) @binding(2) var<storage, read_write> y: array<{elem}>;

{load}

@compute @workgroup_size(64)
fn main(@builtin(global_invocation_id) gid: vec3<u32>) {{
    let row = gid.x;
    if (row >= ROWS) {{
        return;
    }}
    let base = {base_expr};
    var mean_sq = 0.0;
    for (var j = 0u; j < C; j++) {{
        let v = load(base, j);
        mean_sq += v * v;
    }}
    mean_sq /= f32(C);
    let r = inverseSqrt(mean_sq + EPS);
{store}
}}
"#
    )
}

/// Pass 1 of the RMSNorm adjoint: per-row dx plus the per-row dgamma
/// contributions staged into a [rows, C] scratch buffer.
pub fn rms_norm_grad_dx(rows: usize, c: usize) -> String {
    format!(
        r#"
const ROWS: u32 = {rows}u;
const C: u32 = {c}u;
const EPS: f32 = 1e-8;

@group(0) @binding(0) var<storage, read> dy: array<f32>;
@group(0) @binding(1) var<storage, read> x: array<f32>;
@group(0) @binding(2) var<storage, read> gamma: array<f32>;
@group(0) @binding(3) var<storage, read_write> dx: array<f32>;
@group(0) @binding(4) var<storage, read_write> partial: array<f32>;

@compute @workgroup_size(64)
fn main(@builtin(global_invocation_id) gid: vec3<u32>) {{
    let row = gid.x;
    if (row >= ROWS) {{
        return;
    }}
    let base = row * C;
    var mean_sq = 0.0;
    for (var j = 0u; j < C; j++) {{
        mean_sq += x[base + j] * x[base + j];
    }}
    mean_sq /= f32(C);
    let r = inverseSqrt(mean_sq + EPS);

    var dot = 0.0;
    for (var j = 0u; j < C; j++) {{
        dot += dy[base + j] * gamma[j] * x[base + j];
        partial[base + j] = dy[base + j] * x[base + j] * r;
    }}
    let r3_over_c = r * r * r / f32(C);
    for (var j = 0u; j < C; j++) {{
        dx[base + j] = r * dy[base + j] * gamma[j] - x[base + j] * r3_over_c * dot;
    }}
}}
"#
    )
}

/// Pass 2: reduce the staged dgamma contributions over rows, one thread
/// per feature column.
pub fn rms_norm_grad_reduce(rows: usize, c: usize) -> String {
    format!(
        r#"
const ROWS: u32 = {rows}u;
const C: u32 = {c}u;

@group(0) @binding(0) var<storage, read> partial: array<f32>;
@group(0) @binding(1) var<storage, read_write> dgamma: array<f32>;

@compute @workgroup_size(64)
fn main(@builtin(global_invocation_id) gid: vec3<u32>) {{
    let j = gid.x;
    if (j >= C) {{
        return;
    }}
    var acc = 0.0;
    for (var row = 0u; row < ROWS; row++) {{
        acc += partial[row * C + j];
    }}
    dgamma[j] = acc;
}}
"#
    )
}

/// Sliding-window cache append as pure word moves, one thread per output
/// row; packed rows copy lanes untouched.
pub fn append_cache(rows: usize, t_out: usize, ct: usize, words: usize, shift: bool) -> String {
    let body = if shift {
        // The uniform is referenced so the auto layout still includes it.
        format!(
            r#"
    _ = params.past_len;
    if (t == T_OUT - 1u) {{
        for (var w = 0u; w < W; w++) {{
            out[row * W + w] = item[bh * W + w];
        }}
    }} else {{
        for (var w = 0u; w < W; w++) {{
            out[row * W + w] = cache[(bh * {ct}u + t + 1u) * W + w];
        }}
    }}"#
        )
    } else {
        format!(
            r#"
    if (t == params.past_len) {{
        for (var w = 0u; w < W; w++) {{
            out[row * W + w] = item[bh * W + w];
        }}
    }} else if (t < {ct}u) {{
        for (var w = 0u; w < W; w++) {{
            out[row * W + w] = cache[(bh * {ct}u + t) * W + w];
        }}
    }} else {{
        for (var w = 0u; w < W; w++) {{
            out[row * W + w] = 0u;
        }}
    }}"#
        )
    };
    format!(
        r#"
const ROWS: u32 = {rows}u;
const T_OUT: u32 = {t_out}u;
const W: u32 = {words}u;

struct Params {{
    past_len: u32,
    pad0: u32,
    pad1: u32,
    pad2: u32,
}}

@group(0) @binding(0) var<storage, read> cache: array<u32>;
@group(0) @binding(1) var<storage, read> item: array<u32>;
@group(0) @binding(2) var<storage, read_write> out: array<u32>;
@group(0) @binding(3) var<uniform> params: Params;

@compute @workgroup_size(256)
fn main(@builtin(global_invocation_id) gid: vec3<u32>) {{
    let row = gid.x;
    if (row >= ROWS) {{
        return;
    }}
    let t = row % T_OUT;
    let bh = row / T_OUT;
{body}
}}
"#
    )
}

pub fn gather_sub(b: usize, k: usize) -> String {
    format!(
        r#"
const B: u32 = {b}u;
const K: u32 = {k}u;

@group(0) @binding(0) var<storage, read> values: array<f32>;
@group(0) @binding(1) var<storage, read> labels: array<i32>;
@group(0) @binding(2) var<storage, read> logits: array<f32>;
@group(0) @binding(3) var<storage, read_write> out: array<f32>;

@compute @workgroup_size(64)
fn main(@builtin(global_invocation_id) gid: vec3<u32>) {{
    let bi = gid.x;
    if (bi >= B) {{
        return;
    }}
    out[bi] = values[bi] - logits[bi * K + u32(labels[bi])];
}}
"#
    )
}

pub fn scatter_sub(b: usize, k: usize) -> String {
    format!(
        r#"
const B: u32 = {b}u;
const K: u32 = {k}u;

@group(0) @binding(0) var<storage, read> probs: array<f32>;
@group(0) @binding(1) var<storage, read> labels: array<i32>;
@group(0) @binding(2) var<storage, read> dy: array<f32>;
@group(0) @binding(3) var<storage, read_write> out: array<f32>;

@compute @workgroup_size(256)
fn main(@builtin(global_invocation_id) gid: vec3<u32>) {{
    let idx = gid.x;
    if (idx >= B * K) {{
        return;
    }}
    let bi = idx / K;
    let ki = idx % K;
    var v = probs[idx];
    if (ki == u32(labels[bi])) {{
        v -= 1.0;
    }}
    out[idx] = v * dy[bi];
}}
"#
    )
}

pub fn adam_moments(n: usize) -> String {
    format!(
        r#"
const N: u32 = {n}u;

struct Params {{
    beta1: f32,
    beta2: f32,
    pad0: u32,
    pad1: u32,
}}

@group(0) @binding(0) var<storage, read> moments: array<u32>;
@group(0) @binding(1) var<storage, read> grad: array<f32>;
@group(0) @binding(2) var<storage, read_write> out: array<u32>;
@group(0) @binding(3) var<uniform> params: Params;

@compute @workgroup_size(256)
fn main(@builtin(global_invocation_id) gid: vec3<u32>) {{
    let i = gid.x;
    if (i >= N) {{
        return;
    }}
    let pair = unpack2x16float(moments[i]);
    let g = clamp(grad[i], -1.0, 1.0);
    let m1 = params.beta1 * pair.x + (1.0 - params.beta1) * g;
    let m2 = params.beta2 * pair.y + (1.0 - params.beta2) * g * g;
    out[i] = pack2x16float(vec2<f32>(m1, m2));
}}
"#
    )
}

pub fn adam_adjust(n: usize) -> String {
    format!(
        r#"
const N: u32 = {n}u;

struct Params {{
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    lr: f32,
}}

@group(0) @binding(0) var<storage, read> moments: array<u32>;
@group(0) @binding(1) var<storage, read> value: array<f32>;
@group(0) @binding(2) var<storage, read_write> out: array<f32>;
@group(0) @binding(3) var<uniform> params: Params;

@compute @workgroup_size(256)
fn main(@builtin(global_invocation_id) gid: vec3<u32>) {{
    let i = gid.x;
    if (i >= N) {{
        return;
    }}
    let pair = unpack2x16float(moments[i]);
    out[i] = value[i] - params.lr * (pair.x / params.beta1)
        / (sqrt(pair.y / params.beta2) + params.epsilon);
}}
"#
    )
}

/// Elementwise binary arithmetic. Dense variants work per element, packed
/// variants per lane with both halves processed together.
pub fn binary(n_words: usize, op: char, packed: bool) -> String {
    let body = if packed {
        format!(
            r#"
    let pa = unpack2x16float(a[i]);
    let pb = unpack2x16float(b[i]);
    out[i] = pack2x16float(vec2<f32>(pa.x {op} pb.x, pa.y {op} pb.y));"#
        )
    } else {
        format!("\n    out[i] = a[i] {op} b[i];")
    };
    let elem = if packed { "u32" } else { "f32" };
    format!(
        r#"
const N: u32 = {n_words}u;

@group(0) @binding(0) var<storage, read> a: array<{elem}>;
@group(0) @binding(1) var<storage, read> b: array<{elem}>;
@group(0) @binding(2) var<storage, read_write> out: array<{elem}>;

@compute @workgroup_size(256)
fn main(@builtin(global_invocation_id) gid: vec3<u32>) {{
    let i = gid.x;
    if (i >= N) {{
        return;
    }}{body}
}}
"#
    )
}

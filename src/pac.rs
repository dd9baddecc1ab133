//! PAC (Proxy Auto-Config) evaluation (C3): runs a PAC script's
//! `FindProxyForURL(url, host)` in a sandboxed JS engine and parses its
//! return value via [`crate::proxylist`].
//!
//! The evaluator has no ambient I/O beyond the helper predicates it
//! registers natively (`dnsResolve`, `myIpAddress`, …) — grounded on the
//! resolver-cache shape in the reference PAC/proxy-resolver pattern in this
//! codebase's lineage, adapted from an actor-based cache to a plain
//! synchronous evaluator since a PAC script itself has no concurrency of
//! its own.

use std::net::{IpAddr, ToSocketAddrs};

use boa_engine::{
    js_string,
    native_function::NativeFunction,
    Context, JsArgs, JsResult, JsString, JsValue, Source,
};

use crate::error::{PxError, Result};
use crate::proxylist::{parse_pac_return, Upstream};

/// A loaded PAC script, ready to be evaluated per request.
///
/// Each call to [`PacScript::find_proxy_for_url`] builds a fresh
/// `boa_engine::Context`: PAC scripts are small and evaluation is not on a
/// tight hot path relative to a network round trip, so isolating each
/// evaluation avoids any possibility of state leaking between unrelated
/// requests (a PAC script cannot set global variables that survive).
pub struct PacScript {
    source: String,
}

impl PacScript {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
        }
    }

    /// Evaluate `FindProxyForURL(url, host)` and parse the return value
    /// into an ordered upstream list. Any evaluation failure is reported to
    /// the caller, who is expected (per the resolver's host-ignored-failure
    /// policy) to fall back to `[DIRECT]`.
    pub fn find_proxy_for_url(&self, url: &str, host: &str) -> Result<Vec<Upstream>> {
        let mut ctx = Context::default();
        register_helpers(&mut ctx)
            .map_err(|e| PxError::PacEvaluation(format!("failed to register helpers: {e}")))?;

        ctx.eval(Source::from_bytes(self.source.as_bytes()))
            .map_err(|e| PxError::PacEvaluation(format!("script load failed: {e}")))?;

        let global = ctx.global_object();
        let find_proxy = global
            .get(js_string!("FindProxyForURL"), &mut ctx)
            .map_err(|e| PxError::PacEvaluation(e.to_string()))?;

        let func = find_proxy
            .as_callable()
            .ok_or_else(|| PxError::PacEvaluation("FindProxyForURL is not callable".into()))?;

        let result = func
            .call(
                &JsValue::undefined(),
                &[JsValue::from(js_string!(url)), JsValue::from(js_string!(host))],
                &mut ctx,
            )
            .map_err(|e| PxError::PacEvaluation(e.to_string()))?;

        let text = result
            .to_string(&mut ctx)
            .map_err(|e| PxError::PacEvaluation(e.to_string()))?
            .to_std_string_escaped();

        Ok(parse_pac_return(&text))
    }
}

fn register_helpers(ctx: &mut Context) -> JsResult<()> {
    let global = ctx.global_object();

    global.set(
        js_string!("isPlainHostName"),
        build_fn(ctx, is_plain_host_name),
        false,
        ctx,
    )?;
    global.set(js_string!("dnsDomainIs"), build_fn(ctx, dns_domain_is), false, ctx)?;
    global.set(js_string!("isInNet"), build_fn(ctx, is_in_net), false, ctx)?;
    global.set(js_string!("myIpAddress"), build_fn(ctx, my_ip_address), false, ctx)?;
    global.set(js_string!("dnsResolve"), build_fn(ctx, dns_resolve), false, ctx)?;
    global.set(js_string!("shExpMatch"), build_fn(ctx, sh_exp_match), false, ctx)?;
    global.set(
        js_string!("alert"),
        build_fn(ctx, |_this, _args, _ctx| Ok(JsValue::undefined())),
        false,
        ctx,
    )?;

    Ok(())
}

fn build_fn(
    ctx: &mut Context,
    f: fn(&JsValue, &[JsValue], &mut Context) -> JsResult<JsValue>,
) -> JsValue {
    NativeFunction::from_fn_ptr(f).to_js_function(ctx.realm()).into()
}

fn arg_str(args: &[JsValue], idx: usize, ctx: &mut Context) -> JsResult<String> {
    Ok(args.get_or_undefined(idx).to_string(ctx)?.to_std_string_escaped())
}

/// `isPlainHostName(host)`: true if host has no dots (no domain suffix).
fn is_plain_host_name(_this: &JsValue, args: &[JsValue], ctx: &mut Context) -> JsResult<JsValue> {
    let host = arg_str(args, 0, ctx)?;
    Ok(JsValue::from(!host.contains('.')))
}

/// `dnsDomainIs(host, domain)`: true if host ends with domain.
fn dns_domain_is(_this: &JsValue, args: &[JsValue], ctx: &mut Context) -> JsResult<JsValue> {
    let host = arg_str(args, 0, ctx)?;
    let domain = arg_str(args, 1, ctx)?;
    Ok(JsValue::from(host.ends_with(&domain)))
}

/// `isInNet(host, pattern, mask)`: true if host's resolved IPv4 address is
/// within the dotted-decimal network/mask pair.
fn is_in_net(_this: &JsValue, args: &[JsValue], ctx: &mut Context) -> JsResult<JsValue> {
    let host = arg_str(args, 0, ctx)?;
    let pattern = arg_str(args, 1, ctx)?;
    let mask = arg_str(args, 2, ctx)?;

    let resolved = match resolve_one(&host) {
        Some(IpAddr::V4(v4)) => v4,
        _ => return Ok(JsValue::from(false)),
    };
    let (Ok(net), Ok(mask)) = (pattern.parse::<std::net::Ipv4Addr>(), mask.parse::<std::net::Ipv4Addr>())
    else {
        return Ok(JsValue::from(false));
    };

    let host_bits = u32::from(resolved);
    let net_bits = u32::from(net);
    let mask_bits = u32::from(mask);
    Ok(JsValue::from(host_bits & mask_bits == net_bits & mask_bits))
}

/// `myIpAddress()`: best-effort local outward-facing address. PAC scripts
/// use this to branch on which network segment the client is on.
fn my_ip_address(_this: &JsValue, _args: &[JsValue], _ctx: &mut Context) -> JsResult<JsValue> {
    let addr = local_ip_guess().unwrap_or_else(|| "127.0.0.1".to_string());
    Ok(JsValue::from(js_string!(addr)))
}

fn local_ip_guess() -> Option<String> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    socket.local_addr().ok().map(|a| a.ip().to_string())
}

/// `dnsResolve(host)`: blocking forward lookup, first address, empty
/// string on failure (PAC scripts test for `""` as failure).
fn dns_resolve(_this: &JsValue, args: &[JsValue], ctx: &mut Context) -> JsResult<JsValue> {
    let host = arg_str(args, 0, ctx)?;
    let resolved = resolve_one(&host).map(|ip| ip.to_string()).unwrap_or_default();
    Ok(JsValue::from(js_string!(resolved)))
}

fn resolve_one(host: &str) -> Option<IpAddr> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Some(ip);
    }
    (host, 0u16)
        .to_socket_addrs()
        .ok()
        .and_then(|mut it| it.next())
        .map(|sa| sa.ip())
}

/// `shExpMatch(str, pattern)`: shell-glob match (`*` and `?` wildcards).
fn sh_exp_match(_this: &JsValue, args: &[JsValue], ctx: &mut Context) -> JsResult<JsValue> {
    let s = arg_str(args, 0, ctx)?;
    let pattern = arg_str(args, 1, ctx)?;
    Ok(JsValue::from(glob_match(&pattern, &s)))
}

fn glob_match(pattern: &str, text: &str) -> bool {
    fn inner(p: &[u8], t: &[u8]) -> bool {
        match (p.first(), t.first()) {
            (None, None) => true,
            (Some(b'*'), _) => inner(&p[1..], t) || (!t.is_empty() && inner(p, &t[1..])),
            (Some(b'?'), Some(_)) => inner(&p[1..], &t[1..]),
            (Some(pc), Some(tc)) if pc == tc => inner(&p[1..], &t[1..]),
            _ => false,
        }
    }
    inner(pattern.as_bytes(), text.as_bytes())
}

#[allow(dead_code)]
fn _assert_js_string_used(_: JsString) {}

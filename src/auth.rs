//! Handshake parsing and auth response computation
use sha1::{Digest, Sha1};

use crate::constants::{CapabilitySet, capability};
use crate::error::{At, Error, ErrorKind, Result};
use crate::packet::{PacketBuilder, PacketReader};

/// Auth plugin requested by the server
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum AuthPlugin {
    /// `mysql_native_password`, the scramble-hash scheme
    NativePassword,
    /// `mysql_clear_password`, the password sent verbatim
    ClearPassword,
}

impl AuthPlugin {
    /// Resolve a plugin name from the greeting
    pub(crate) fn from_name(name: &str) -> Result<Self> {
        match name {
            "mysql_native_password" => Ok(AuthPlugin::NativePassword),
            "mysql_clear_password" => Ok(AuthPlugin::ClearPassword),
            other => Err(ErrorKind::UnsupportedAuthPlugin(other.to_string()).into()),
        }
    }

    /// The wire name of the plugin
    pub(crate) fn name(self) -> &'static str {
        match self {
            AuthPlugin::NativePassword => "mysql_native_password",
            AuthPlugin::ClearPassword => "mysql_clear_password",
        }
    }
}

/// The initial greeting the server sends after the stream opens
#[derive(Debug)]
pub(crate) struct Greeting {
    /// Human-readable server version
    pub(crate) server_version: String,
    /// Server-assigned id of this connection
    pub(crate) connection_id: u32,
    /// The random bytes the password is hashed with
    pub(crate) scramble: Vec<u8>,
    /// Raw capability bits the server advertised
    pub(crate) capabilities: u32,
    /// Auth plugin the server wants
    pub(crate) plugin: AuthPlugin,
}

impl Greeting {
    /// Parse a greeting payload, tagged 0x0A.
    ///
    /// Fields past the second scramble half are optional if the packet ends.
    pub(crate) fn parse(payload: &[u8]) -> Result<Greeting> {
        let mut r = PacketReader::new(payload);
        r.expect_u8("protocol version", 0x0A).at("protocol version")?;
        let server_version = r.get_null_str().at("server version")?.to_string();
        let connection_id = r.get_u32().at("connection id")?;
        let mut scramble = r.get_bytes(8).at("scramble")?.to_vec();
        r.expect_u8("scramble filler", 0).at("scramble filler")?;
        let capability_lo = r.get_u16().at("capability flags")?;
        let _charset = r.get_u8().at("charset")?;
        let _status = r.get_u16().at("status flags")?;
        let capability_hi = r.get_u16().at("capability flags")?;
        let auth_data_len = r.get_u8().at("auth data length")?;
        r.get_bytes(10).at("reserved")?;
        let capabilities = capability_lo as u32 | ((capability_hi as u32) << 16);

        if capabilities & capability::SECURE_CONNECTION != 0 && !r.is_empty() {
            let wanted = 13usize.max((auth_data_len as usize).saturating_sub(8));
            let part2 = r.get_bytes(wanted.min(r.remaining())).at("scramble")?;
            scramble.extend_from_slice(part2);
            // the second half is NUL-padded; only the first 20 bytes count
            scramble.truncate(20);
        }

        let plugin = if r.is_empty() {
            AuthPlugin::NativePassword
        } else {
            let name = match r.get_null_str() {
                Ok(name) => name,
                // terminator may be missing when the name is the last field
                Err(_) => r.get_eof_str().at("auth plugin")?,
            };
            AuthPlugin::from_name(name)?
        };

        Ok(Greeting {
            server_version,
            connection_id,
            scramble,
            capabilities,
            plugin,
        })
    }
}

/// Compute the auth response bytes for the given plugin.
///
/// `mysql_native_password` is
/// `SHA1(password) XOR SHA1(scramble[0..20] || SHA1(SHA1(password)))`;
/// an empty password always yields an empty response.
pub(crate) fn auth_response(plugin: AuthPlugin, password: &str, scramble: &[u8]) -> Vec<u8> {
    match plugin {
        AuthPlugin::NativePassword => {
            if password.is_empty() {
                return Vec::new();
            }
            let scramble = &scramble[..scramble.len().min(20)];
            let mut ctx = Sha1::new();
            ctx.update(password.as_bytes());
            let mut pw_hash = ctx.finalize_reset();
            ctx.update(pw_hash);
            let pw_hash_hash = ctx.finalize_reset();
            ctx.update(scramble);
            ctx.update(pw_hash_hash);
            let mix = ctx.finalize_reset();
            for (a, b) in pw_hash.iter_mut().zip(mix) {
                *a ^= b;
            }
            pw_hash.to_vec()
        }
        AuthPlugin::ClearPassword => password.as_bytes().to_vec(),
    }
}

/// Compose the handshake response payload
pub(crate) fn build_handshake_response(
    capabilities: CapabilitySet,
    charset: u8,
    user: &str,
    auth: &[u8],
    plugin: AuthPlugin,
) -> PacketBuilder {
    let mut b = PacketBuilder::new();
    b.put_u32(capabilities.bits());
    b.put_u32(0xFF_FFFF); // max packet size
    b.put_u8(charset);
    b.put_slice(&[0; 23]);
    b.put_str_null(user);
    if capabilities.contains(capability::PLUGIN_AUTH_LENENC_CLIENT_DATA) {
        b.put_lenenc_bytes(auth);
    } else if capabilities.contains(capability::SECURE_CONNECTION) {
        b.put_u8(auth.len() as u8);
        b.put_slice(auth);
    } else {
        b.put_slice(auth);
        b.put_u8(0);
    }
    if capabilities.contains(capability::PLUGIN_AUTH) {
        b.put_str_null(plugin.name());
    }
    b
}

/// Map an ERR packet received during the handshake to an auth rejection
pub(crate) fn rejected(err: Error) -> Error {
    match err.kind() {
        ErrorKind::Server { code, message, .. } => ErrorKind::AuthRejected {
            code: *code,
            message: message.clone(),
        }
        .into(),
        _ => err,
    }
}

// Copyright 2019 CoreOS, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Clevis pin evaluator (§4.G): given a JWE token carried in a LUKS2
//! slot, recovers the passphrase via the `tpm2` or `tang` pin. A pin
//! failure is never fatal to the overall unlock — it falls back to the
//! next slot or the interactive prompt (§4.F).

use anyhow::{bail, Context, Result};
use openssl::bn::BigNumContext;
use openssl::derive::Deriver;
use openssl::ec::{EcGroup, EcKey, EcPoint, PointConversionForm};
use openssl::nid::Nid;
use openssl::pkey::PKey;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClevisError {
    #[error("JWE has no recognizable clevis pin configuration")]
    NoPin,
    #[error("tpm2 pin failed: {0}")]
    Tpm2(String),
    #[error("tang pin failed: {0}")]
    Tang(String),
}

#[derive(Debug, Deserialize)]
struct JweProtectedHeader {
    clevis: ClevisHeader,
}

#[derive(Debug, Deserialize)]
struct ClevisHeader {
    pin: String,
    #[serde(default)]
    tpm2: Option<Tpm2Config>,
    #[serde(default)]
    tang: Option<TangConfig>,
}

#[derive(Debug, Deserialize)]
struct Tpm2Config {
    hash: String,
    key: String,
    #[serde(default)]
    pcr_ids: Option<String>,
    #[serde(default)]
    pcr_bank: Option<String>,
    jwk_pub: String,
    jwk_priv: String,
}

#[derive(Debug, Deserialize)]
struct TangConfig {
    url: String,
    #[serde(default)]
    adv: Option<serde_json::Value>,
}

/// A parsed compact JWE: `protected.encrypted_key.iv.ciphertext.tag`.
pub struct Jwe {
    pub header: ClevisHeader,
    pub encrypted_key: Vec<u8>,
    pub iv: Vec<u8>,
    pub ciphertext: Vec<u8>,
    pub tag: Vec<u8>,
    pub protected_b64: String,
}

pub fn parse_jwe(compact: &str) -> Result<Jwe> {
    let parts: Vec<&str> = compact.split('.').collect();
    if parts.len() != 5 {
        bail!("JWE does not have 5 compact segments");
    }
    let protected_json = base64::decode_config(parts[0], base64::URL_SAFE_NO_PAD)
        .context("base64-decoding JWE protected header")?;
    let header: JweProtectedHeader =
        serde_json::from_slice(&protected_json).context("parsing JWE protected header")?;
    Ok(Jwe {
        header: header.clevis,
        encrypted_key: base64::decode_config(parts[1], base64::URL_SAFE_NO_PAD)
            .unwrap_or_default(),
        iv: base64::decode_config(parts[2], base64::URL_SAFE_NO_PAD).context("decoding iv")?,
        ciphertext: base64::decode_config(parts[3], base64::URL_SAFE_NO_PAD)
            .context("decoding ciphertext")?,
        tag: base64::decode_config(parts[4], base64::URL_SAFE_NO_PAD).context("decoding tag")?,
        protected_b64: parts[0].to_string(),
    })
}

/// Attempts to recover the plaintext (the LUKS passphrase) from a
/// Clevis-wrapped JWE, trying whichever pin the token declares. Network
/// access is required for `tang`; none for `tpm2`.
pub fn recover(jwe_compact: &str, network: Option<&crate::network::NetworkHandle>) -> Result<Vec<u8>> {
    let jwe = parse_jwe(jwe_compact)?;
    match jwe.header.pin.as_str() {
        "tpm2" => {
            let cfg = jwe.header.tpm2.as_ref().ok_or(ClevisError::NoPin)?;
            recover_tpm2(&jwe, cfg).map_err(|e| ClevisError::Tpm2(e.to_string()).into())
        }
        "tang" => {
            let cfg = jwe.header.tang.as_ref().ok_or(ClevisError::NoPin)?;
            if network.is_none() {
                bail!(ClevisError::Tang("network required but unavailable".into()));
            }
            recover_tang(&jwe, cfg).map_err(|e| ClevisError::Tang(e.to_string()).into())
        }
        other => bail!("unsupported clevis pin \"{}\"", other),
    }
}

/// Unseals the wrapped JWK under the TPM2 primary key matching the
/// config's template, optionally gated by a PCR policy, then decrypts
/// the JWE payload with it (§4.G). `jwk_pub`/`jwk_priv` are, despite the
/// name, base64url-encoded marshalled `TPM2B_PUBLIC`/`TPM2B_PRIVATE`
/// structures, not JSON — clevis-tpm2 never persists a primary key, it
/// recreates the same one on every unseal from the owner hierarchy's
/// seed using the fixed template keyed by `cfg.key` ("rsa" or "ecc").
fn recover_tpm2(jwe: &Jwe, cfg: &Tpm2Config) -> Result<Vec<u8>> {
    use tss_esapi::constants::SessionType;
    use tss_esapi::interface_types::reserved_handles::Hierarchy;
    use tss_esapi::structures::{Digest as TpmDigest, SymmetricDefinition};
    use tss_esapi::traits::UnMarshall;
    use tss_esapi::{Context, TctiNameConf};

    let pub_bytes = base64::decode_config(&cfg.jwk_pub, base64::URL_SAFE_NO_PAD)
        .context("decoding jwk_pub")?;
    let priv_bytes = base64::decode_config(&cfg.jwk_priv, base64::URL_SAFE_NO_PAD)
        .context("decoding jwk_priv")?;
    let wrapped_public = tss_esapi::structures::Public::unmarshall(&pub_bytes)
        .context("unmarshalling wrapped TPM2B_PUBLIC")?;
    let wrapped_private = tss_esapi::structures::Private::unmarshall(&priv_bytes)
        .context("unmarshalling wrapped TPM2B_PRIVATE")?;

    let tcti = TctiNameConf::from_environment_variable()
        .context("resolving TPM2 TCTI (set TCTI_NAME or use the default /dev/tpmrm0)")?;
    let mut context = Context::new(tcti).context("opening TPM2 resource manager context")?;

    let primary_public = primary_template(&cfg.key)?;
    let primary = context
        .execute_with_nullauth_session(|ctx| {
            ctx.create_primary(Hierarchy::Owner, primary_public.clone(), None, None, None, None)
        })
        .context("creating clevis tpm2 primary key")?;

    let object_handle = context
        .execute_with_nullauth_session(|ctx| {
            ctx.load(primary.key_handle, wrapped_private.clone(), wrapped_public.clone())
        })
        .context("loading wrapped clevis object under the primary key")?;

    let hash_alg = hash_algorithm(&cfg.hash)?;
    let unsealed = match &cfg.pcr_ids {
        Some(pcr_ids) => {
            let pcr_selection = pcr_selection(pcr_ids, cfg.pcr_bank.as_deref(), hash_alg)?;
            let session_opt = context
                .start_auth_session(
                    None,
                    None,
                    None,
                    SessionType::Policy,
                    SymmetricDefinition::AES_128_CFB,
                    hash_alg,
                )
                .context("starting TPM2 policy session")?;
            let session = session_opt.context("TPM2 did not return a policy session")?;
            context
                .policy_pcr(
                    session
                        .try_into()
                        .context("policy session does not support PCR binding")?,
                    TpmDigest::default(),
                    pcr_selection,
                )
                .context("binding policy session to PCR values")?;
            context
                .execute_with_session(Some(session), |ctx| ctx.unseal(object_handle.into()))
                .context("unsealing clevis secret under PCR policy")?
        }
        None => context
            .execute_with_nullauth_session(|ctx| ctx.unseal(object_handle.into()))
            .context("unsealing clevis secret")?,
    };

    let secret = unsealed.value().to_vec();
    let _ = context.flush_context(object_handle.into());
    let _ = context.flush_context(primary.key_handle.into());
    decrypt_jwe_payload(jwe, &secret)
}

/// Builds the fixed primary-key template clevis-tpm2 provisions under,
/// keyed only by the algorithm it names (no other parameter varies it).
fn primary_template(key_alg: &str) -> Result<tss_esapi::structures::Public> {
    use tss_esapi::attributes::ObjectAttributesBuilder;
    use tss_esapi::interface_types::algorithm::{HashingAlgorithm, PublicAlgorithm};
    use tss_esapi::interface_types::ecc::EccCurve;
    use tss_esapi::interface_types::key_bits::RsaKeyBits;
    use tss_esapi::structures::{
        EccScheme, PublicBuilder, PublicEccParametersBuilder, PublicKeyRsa,
        PublicRsaParametersBuilder, RsaExponent, RsaScheme, SymmetricDefinitionObject,
    };

    let object_attributes = ObjectAttributesBuilder::new()
        .with_fixed_tpm(true)
        .with_fixed_parent(true)
        .with_sensitive_data_origin(true)
        .with_user_with_auth(true)
        .with_decrypt(true)
        .with_restricted(true)
        .build()
        .context("building clevis primary key object attributes")?;

    match key_alg {
        "rsa" => {
            let rsa_params = PublicRsaParametersBuilder::new()
                .with_symmetric(SymmetricDefinitionObject::AES_128_CFB)
                .with_scheme(RsaScheme::Null)
                .with_key_bits(RsaKeyBits::Rsa2048)
                .with_exponent(RsaExponent::default())
                .with_is_decryption_key(true)
                .with_restricted(true)
                .build()
                .context("building clevis RSA primary parameters")?;
            PublicBuilder::new()
                .with_public_algorithm(PublicAlgorithm::Rsa)
                .with_name_hashing_algorithm(HashingAlgorithm::Sha256)
                .with_object_attributes(object_attributes)
                .with_rsa_parameters(rsa_params)
                .with_rsa_unique_identifier(PublicKeyRsa::default())
                .build()
                .context("building clevis RSA primary template")
        }
        "ecc" | "" => {
            let ecc_params = PublicEccParametersBuilder::new()
                .with_symmetric(SymmetricDefinitionObject::AES_128_CFB)
                .with_ecc_scheme(EccScheme::Null)
                .with_curve(EccCurve::NistP256)
                .with_is_decryption_key(true)
                .with_restricted(true)
                .build()
                .context("building clevis ECC primary parameters")?;
            PublicBuilder::new()
                .with_public_algorithm(PublicAlgorithm::Ecc)
                .with_name_hashing_algorithm(HashingAlgorithm::Sha256)
                .with_object_attributes(object_attributes)
                .with_ecc_parameters(ecc_params)
                .with_ecc_unique_identifier(Default::default())
                .build()
                .context("building clevis ECC primary template")
        }
        other => bail!("unsupported tpm2 pin primary key type \"{}\"", other),
    }
}

fn hash_algorithm(name: &str) -> Result<tss_esapi::interface_types::algorithm::HashingAlgorithm> {
    use tss_esapi::interface_types::algorithm::HashingAlgorithm;
    Ok(match name.to_ascii_lowercase().as_str() {
        "sha1" => HashingAlgorithm::Sha1,
        "sha256" => HashingAlgorithm::Sha256,
        "sha384" => HashingAlgorithm::Sha384,
        "sha512" => HashingAlgorithm::Sha512,
        other => bail!("unsupported PCR bank hash algorithm \"{}\"", other),
    })
}

fn pcr_selection(
    pcr_ids: &str,
    bank: Option<&str>,
    default_hash: tss_esapi::interface_types::algorithm::HashingAlgorithm,
) -> Result<tss_esapi::structures::PcrSelectionList> {
    use tss_esapi::structures::PcrSelectionListBuilder;

    let hash_alg = match bank {
        Some(b) => hash_algorithm(b)?,
        None => default_hash,
    };
    let slots = pcr_ids
        .split(',')
        .map(|s| {
            s.trim()
                .parse::<u8>()
                .map_err(|_| anyhow::anyhow!("invalid PCR id \"{}\"", s))
                .and_then(pcr_slot)
        })
        .collect::<Result<Vec<_>>>()?;
    PcrSelectionListBuilder::new()
        .with_selection(hash_alg, &slots)
        .build()
        .context("building PCR selection list")
}

fn pcr_slot(n: u8) -> Result<tss_esapi::structures::PcrSlot> {
    use tss_esapi::structures::PcrSlot;
    Ok(match n {
        0 => PcrSlot::Slot0,
        1 => PcrSlot::Slot1,
        2 => PcrSlot::Slot2,
        3 => PcrSlot::Slot3,
        4 => PcrSlot::Slot4,
        5 => PcrSlot::Slot5,
        6 => PcrSlot::Slot6,
        7 => PcrSlot::Slot7,
        8 => PcrSlot::Slot8,
        9 => PcrSlot::Slot9,
        10 => PcrSlot::Slot10,
        11 => PcrSlot::Slot11,
        12 => PcrSlot::Slot12,
        13 => PcrSlot::Slot13,
        14 => PcrSlot::Slot14,
        15 => PcrSlot::Slot15,
        16 => PcrSlot::Slot16,
        17 => PcrSlot::Slot17,
        18 => PcrSlot::Slot18,
        19 => PcrSlot::Slot19,
        20 => PcrSlot::Slot20,
        21 => PcrSlot::Slot21,
        22 => PcrSlot::Slot22,
        23 => PcrSlot::Slot23,
        other => bail!("PCR index {} out of range", other),
    })
}

/// Performs the tang/McCallum–Relyea recovery: generate an ephemeral EC
/// key, derive against the advertised server key, POST the exchange
/// point to `/rec/<thp>`, and use the response (§4.G).
fn recover_tang(jwe: &Jwe, cfg: &TangConfig) -> Result<Vec<u8>> {
    let adv = match &cfg.adv {
        Some(v) => v.clone(),
        None => fetch_advertisement(&cfg.url)?,
    };
    let server_keys = parse_advertisement(&adv)?;
    let sig_key = server_keys
        .iter()
        .find(|k| k.use_.as_deref() == Some("sig"))
        .context("advertisement has no signing key")?;
    let exchange_key = server_keys
        .iter()
        .find(|k| k.use_.as_deref() == Some("deriving") || k.use_.is_none())
        .context("advertisement has no exchange key")?;
    let thp = thumbprint(exchange_key);

    let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1)
        .context("creating EC group for tang exchange")?;
    let ephemeral = EcKey::generate(&group).context("generating ephemeral EC key")?;

    let server_point = point_from_coords(&group, &exchange_key.x, &exchange_key.y)?;
    let server_pub = EcKey::from_public_key(&group, &server_point)?;
    let pkey_server = PKey::from_ec_key(server_pub)?;
    let pkey_ephemeral = PKey::from_ec_key(ephemeral.clone())?;

    let mut deriver = Deriver::new(&pkey_ephemeral).context("creating ECDH deriver")?;
    deriver
        .set_peer(&pkey_server)
        .context("setting tang server peer key")?;
    let client_exchange_point = ephemeral_public_point(&group, &ephemeral)?;

    let url = format!("{}/rec/{}", cfg.url.trim_end_matches('/'), thp);
    let client = reqwest::blocking::Client::new();
    let response = client
        .post(&url)
        .body(client_exchange_point.clone())
        .send()
        .with_context(|| format!("POSTing exchange point to {}", url))?;
    if !response.status().is_success() {
        bail!("tang server returned {}", response.status());
    }
    let server_reply = response.bytes().context("reading tang response body")?;

    // The derived secret combines the ECDH shared secret from our
    // ephemeral key against the server's exchange key with the server's
    // /rec reply per McCallum-Relyea; the reply IS the server's half of
    // the point addition in tang's construction, consumed here as the
    // peer for a second derive pass.
    let reply_point = EcPoint::from_bytes(&group, &server_reply, &mut BigNumContext::new()?)
        .context("parsing tang reply as an EC point")?;
    let reply_key = EcKey::from_public_key(&group, &reply_point)?;
    let pkey_reply = PKey::from_ec_key(reply_key)?;
    let mut deriver2 = Deriver::new(&pkey_ephemeral).context("creating second ECDH deriver")?;
    deriver2.set_peer(&pkey_reply)?;
    let secret = deriver2.derive_to_vec().context("deriving tang shared secret")?;

    let mut hasher = Sha256::new();
    hasher.update(&secret);
    let kek = hasher.finalize().to_vec();

    decrypt_jwe_payload(jwe, &kek)
}

fn ephemeral_public_point(group: &EcGroup, key: &EcKey<openssl::pkey::Public>) -> Result<Vec<u8>> {
    let mut ctx = BigNumContext::new()?;
    key.public_key()
        .to_bytes(group, PointConversionForm::UNCOMPRESSED, &mut ctx)
        .context("serializing ephemeral EC point")
}

fn point_from_coords(group: &EcGroup, x: &str, y: &str) -> Result<EcPoint> {
    let x = base64::decode_config(x, base64::URL_SAFE_NO_PAD).context("decoding x coordinate")?;
    let y = base64::decode_config(y, base64::URL_SAFE_NO_PAD).context("decoding y coordinate")?;
    let mut ctx = BigNumContext::new()?;
    let bx = openssl::bn::BigNum::from_slice(&x)?;
    let by = openssl::bn::BigNum::from_slice(&y)?;
    let mut point = EcPoint::new(group)?;
    point.set_affine_coordinates_gfp(group, &bx, &by, &mut ctx)?;
    Ok(point)
}

fn decrypt_jwe_payload(jwe: &Jwe, kek: &[u8]) -> Result<Vec<u8>> {
    use openssl::symm::{decrypt_aead, Cipher};
    let key = &kek[0..kek.len().min(32)];
    let cipher = Cipher::aes_256_gcm();
    decrypt_aead(
        cipher,
        key,
        Some(&jwe.iv),
        jwe.protected_b64.as_bytes(),
        &jwe.ciphertext,
        &jwe.tag,
    )
    .context("decrypting JWE payload with recovered key")
}

#[derive(Debug, Deserialize)]
struct AdvertisedKey {
    #[serde(rename = "use")]
    use_: Option<String>,
    x: String,
    y: String,
}

#[derive(Debug, Deserialize)]
struct Advertisement {
    keys: Vec<AdvertisedKey>,
}

fn fetch_advertisement(url: &str) -> Result<serde_json::Value> {
    let client = reqwest::blocking::Client::new();
    let adv_url = format!("{}/adv", url.trim_end_matches('/'));
    let body = client
        .get(&adv_url)
        .send()
        .with_context(|| format!("fetching advertisement from {}", adv_url))?
        .text()
        .context("reading advertisement body")?;
    serde_json::from_str(&body).context("parsing advertisement JSON")
}

fn parse_advertisement(adv: &serde_json::Value) -> Result<Vec<AdvertisedKey>> {
    // The advertisement itself is a JWS payload; the embedded `payload`
    // field, base64url-decoded, is the actual key set document.
    let payload_b64 = adv
        .get("payload")
        .and_then(|v| v.as_str())
        .context("advertisement missing payload")?;
    let payload = base64::decode_config(payload_b64, base64::URL_SAFE_NO_PAD)
        .context("decoding advertisement payload")?;
    let parsed: Advertisement =
        serde_json::from_slice(&payload).context("parsing advertisement key set")?;
    Ok(parsed.keys)
}

fn thumbprint(key: &AdvertisedKey) -> String {
    // RFC 7638 JWK thumbprint over the canonical {"crv","kty","x","y"}
    // member set; EC P-256 keys only, matching what tang itself issues.
    let canonical = format!(
        "{{\"crv\":\"P-256\",\"kty\":\"EC\",\"x\":\"{}\",\"y\":\"{}\"}}",
        key.x, key.y
    );
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    base64::encode_config(hasher.finalize(), base64::URL_SAFE_NO_PAD)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_jwe_pin_name() {
        let header = serde_json::json!({
            "clevis": {"pin": "tang", "tang": {"url": "http://10.0.2.100:5697"}}
        });
        let header_b64 =
            base64::encode_config(header.to_string(), base64::URL_SAFE_NO_PAD);
        let compact = format!("{}.AA.AA.AA.AA", header_b64);
        let jwe = parse_jwe(&compact).unwrap();
        assert_eq!(jwe.header.pin, "tang");
        assert_eq!(jwe.header.tang.unwrap().url, "http://10.0.2.100:5697");
    }

    #[test]
    fn rejects_malformed_jwe() {
        assert!(parse_jwe("only.three.parts").is_err());
    }

    #[test]
    fn thumbprint_is_deterministic() {
        let k = AdvertisedKey {
            use_: Some("sig".into()),
            x: "abc".into(),
            y: "def".into(),
        };
        assert_eq!(thumbprint(&k), thumbprint(&k));
    }
}

//! Suomi.fi SAML 2.0 service provider adapter.
//!
//! Redirect binding messages (AuthnRequest, LogoutRequest, LogoutResponse)
//! are deflate+base64 encoded and signed at the query-string level with
//! RSA-SHA256, which we both produce with the SP key and verify with the
//! pinned IdP certificate. The POST-bound Response at the ACS is checked
//! structurally (issuer, status, conditions, audience, InResponseTo) and
//! its XML signature is verified against the pinned certificate: the
//! SignatureValue over the SignedInfo bytes, and the Reference digest over
//! the referenced element with the enveloped Signature removed. Identity
//! data is only read from the digest-verified element. The IdP serialises
//! in exclusive c14n form, which is what the byte-span verification relies
//! on.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as B64_STANDARD;
use base64::Engine;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Private, Public};
use openssl::sha;
use openssl::sign::{Signer, Verifier};
use openssl::x509::X509;
use quick_xml::events::Event;
use quick_xml::Reader;
use std::io::{Read, Write};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::prelude::*;

use super::{CallbackParams, CleanedAttributes, FlowState, UpstreamError, UpstreamProvider};

use crate::idm::session::SessionData;

const ATTR_ELECTRONIC_ID: &str = "urn:oid:1.2.246.22";
const ATTR_NATIONAL_ID: &str = "urn:oid:1.2.246.21";
const ATTR_GIVEN_NAME: &str = "urn:oid:2.5.4.42";
const ATTR_SURNAME: &str = "urn:oid:2.5.4.4";
const ATTR_EMAIL: &str = "urn:oid:0.9.2342.19200300.100.1.3";
const SIG_RSA_SHA256: &str = "http://www.w3.org/2001/04/xmldsig-more#rsa-sha256";

#[derive(Debug, Clone)]
pub struct SamlConfig {
    pub provider_id: String,
    pub sp_entity_id: String,
    pub acs_url: Url,
    pub slo_url: Url,
    pub idp_entity_id: String,
    pub idp_sso_url: Url,
    pub idp_slo_url: Url,
    pub idp_cert_pem: String,
    pub sp_key_pem: String,
    pub sp_cert_pem: String,
    /// Per-language ServiceName entries for the metadata document.
    pub service_names: BTreeMap<String, String>,
}

pub struct SamlProvider {
    config: SamlConfig,
    sp_key: PKey<Private>,
    idp_key: PKey<Public>,
    idp_cert_der: Vec<u8>,
}

/// An IdP-initiated LogoutRequest received at the single logout endpoint.
#[derive(Debug, Clone)]
pub struct SloRequest {
    pub request_id: Option<String>,
    pub name_id: String,
    pub session_index: Option<String>,
}

/// What a verified assertion yields.
#[derive(Debug, Clone)]
pub struct SamlAssertion {
    pub name_id: String,
    pub session_index: Option<String>,
    pub authn_context: Option<String>,
    pub attributes: BTreeMap<String, Vec<String>>,
}

impl SamlProvider {
    pub fn new(config: SamlConfig) -> Result<Self, OperationError> {
        let sp_key = PKey::private_key_from_pem(config.sp_key_pem.as_bytes()).map_err(|err| {
            admin_error!(?err, "SP saml key does not parse");
            OperationError::CryptographyError
        })?;
        let idp_cert = X509::from_pem(config.idp_cert_pem.as_bytes()).map_err(|err| {
            admin_error!(?err, "IdP saml certificate does not parse");
            OperationError::CryptographyError
        })?;
        let idp_key = idp_cert
            .public_key()
            .map_err(|_| OperationError::CryptographyError)?;
        let idp_cert_der = idp_cert
            .to_der()
            .map_err(|_| OperationError::CryptographyError)?;
        Ok(SamlProvider {
            config,
            sp_key,
            idp_key,
            idp_cert_der,
        })
    }

    // == redirect binding ==

    fn deflate_b64(xml: &str) -> Result<String, UpstreamError> {
        let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(xml.as_bytes())
            .and_then(|_| encoder.finish())
            .map(|bytes| B64_STANDARD.encode(bytes))
            .map_err(|_| UpstreamError::InvalidResponse("deflate failed".to_string()))
    }

    fn inflate_b64(payload: &str) -> Result<String, UpstreamError> {
        let bytes = B64_STANDARD
            .decode(payload)
            .map_err(|_| UpstreamError::InvalidResponse("payload is not base64".to_string()))?;
        let mut xml = String::new();
        DeflateDecoder::new(bytes.as_slice())
            .read_to_string(&mut xml)
            .map_err(|_| UpstreamError::InvalidResponse("payload does not inflate".to_string()))?;
        Ok(xml)
    }

    /// Build a signed Redirect-binding url. The signature covers the query
    /// string exactly as sent, in SAMLRequest/RelayState/SigAlg order.
    fn signed_redirect(
        &self,
        endpoint: &Url,
        param: &str,
        payload: &str,
        relay_state: Option<&str>,
    ) -> Result<Url, UpstreamError> {
        let mut query = format!("{}={}", param, urlencode(payload));
        if let Some(relay_state) = relay_state {
            query.push_str(&format!("&RelayState={}", urlencode(relay_state)));
        }
        query.push_str(&format!("&SigAlg={}", urlencode(SIG_RSA_SHA256)));

        let mut signer = Signer::new(MessageDigest::sha256(), &self.sp_key)
            .map_err(|_| UpstreamError::SignatureInvalid)?;
        let signature = signer
            .sign_oneshot_to_vec(query.as_bytes())
            .map_err(|_| UpstreamError::SignatureInvalid)?;
        query.push_str(&format!(
            "&Signature={}",
            urlencode(&B64_STANDARD.encode(signature))
        ));

        let mut url = endpoint.clone();
        url.set_query(Some(&query));
        Ok(url)
    }

    /// Verify an incoming Redirect-binding query string against the IdP
    /// certificate. `raw_query` must be the undecoded query as received.
    pub fn verify_redirect_signature(&self, raw_query: &str) -> Result<(), UpstreamError> {
        let mut signed_part: Vec<&str> = Vec::new();
        let mut sig_alg = None;
        let mut signature = None;
        for pair in raw_query.split('&') {
            let key = pair.split('=').next().unwrap_or("");
            match key {
                "SAMLRequest" | "SAMLResponse" | "RelayState" | "SigAlg" => {
                    signed_part.push(pair);
                    if key == "SigAlg" {
                        sig_alg = pair.split_once('=').map(|(_, v)| v);
                    }
                }
                "Signature" => signature = pair.split_once('=').map(|(_, v)| v),
                _ => {}
            }
        }
        let sig_alg = sig_alg
            .and_then(|v| urldecode(v))
            .ok_or_else(|| UpstreamError::InvalidResponse("query without SigAlg".to_string()))?;
        if sig_alg != SIG_RSA_SHA256 {
            return Err(UpstreamError::InvalidResponse(
                "unsupported signature algorithm".to_string(),
            ));
        }
        let signature = signature
            .and_then(|v| urldecode(v))
            .and_then(|v| B64_STANDARD.decode(v).ok())
            .ok_or(UpstreamError::SignatureInvalid)?;

        let signed = signed_part.join("&");
        let mut verifier = Verifier::new(MessageDigest::sha256(), &self.idp_key)
            .map_err(|_| UpstreamError::SignatureInvalid)?;
        match verifier.verify_oneshot(&signature, signed.as_bytes()) {
            Ok(true) => Ok(()),
            _ => Err(UpstreamError::SignatureInvalid),
        }
    }

    // == message construction ==

    fn instant(ct: Duration) -> String {
        OffsetDateTime::from_unix_timestamp(ct.as_secs() as i64)
            .ok()
            .and_then(|t| t.format(&Rfc3339).ok())
            .unwrap_or_default()
    }

    pub fn build_authn_request(&self, request_id: &str, ct: Duration) -> String {
        format!(
            r#"<samlp:AuthnRequest xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion" ID="{id}" Version="2.0" IssueInstant="{instant}" Destination="{dest}" AssertionConsumerServiceURL="{acs}" ProtocolBinding="urn:oasis:names:tc:SAML:2.0:bindings:HTTP-POST"><saml:Issuer>{issuer}</saml:Issuer><samlp:NameIDPolicy Format="urn:oasis:names:tc:SAML:2.0:nameid-format:transient" AllowCreate="true"/></samlp:AuthnRequest>"#,
            id = request_id,
            instant = Self::instant(ct),
            dest = self.config.idp_sso_url,
            acs = self.config.acs_url,
            issuer = self.config.sp_entity_id,
        )
    }

    pub fn build_logout_request(
        &self,
        request_id: &str,
        name_id: &str,
        session_index: Option<&str>,
        ct: Duration,
    ) -> String {
        let session_index = session_index
            .map(|idx| format!("<samlp:SessionIndex>{idx}</samlp:SessionIndex>"))
            .unwrap_or_default();
        format!(
            r#"<samlp:LogoutRequest xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion" ID="{id}" Version="2.0" IssueInstant="{instant}" Destination="{dest}"><saml:Issuer>{issuer}</saml:Issuer><saml:NameID Format="urn:oasis:names:tc:SAML:2.0:nameid-format:transient">{name_id}</saml:NameID>{session_index}</samlp:LogoutRequest>"#,
            id = request_id,
            instant = Self::instant(ct),
            dest = self.config.idp_slo_url,
            issuer = self.config.sp_entity_id,
        )
    }

    /// Signed Redirect-binding url starting single logout at the IdP. The
    /// relay state token travels unmodified through the IdP.
    pub fn logout_redirect(
        &self,
        name_id: &str,
        session_index: Option<&str>,
        relay_state: &str,
        ct: Duration,
    ) -> Result<Url, UpstreamError> {
        let request_id = format!("_{}", Uuid::new_v4().simple());
        let xml = self.build_logout_request(&request_id, name_id, session_index, ct);
        let payload = Self::deflate_b64(&xml)?;
        self.signed_redirect(
            &self.config.idp_slo_url,
            "SAMLRequest",
            &payload,
            Some(relay_state),
        )
    }

    /// Decode a Redirect-binding SAMLRequest payload into the single logout
    /// request it carries.
    pub fn parse_logout_request(payload: &str) -> Result<SloRequest, UpstreamError> {
        let xml = Self::inflate_b64(payload)?;
        let mut reader = Reader::from_str(&xml);
        reader.trim_text(true);
        let mut request_id = None;
        loop {
            match reader.read_event() {
                Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                    let name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                    if name.rsplit(':').next().unwrap_or(&name) == "LogoutRequest" {
                        for attr in e.attributes().flatten() {
                            if attr.key.as_ref() == b"ID" {
                                request_id = String::from_utf8(attr.value.to_vec()).ok();
                            }
                        }
                    }
                }
                Ok(Event::Eof) => break,
                Err(_) => {
                    return Err(UpstreamError::InvalidResponse(
                        "LogoutRequest does not parse".to_string(),
                    ))
                }
                _ => {}
            }
        }
        let name_id = extract_text(&xml, "NameID").ok_or_else(|| {
            UpstreamError::InvalidResponse("LogoutRequest without NameID".to_string())
        })?;
        Ok(SloRequest {
            request_id,
            name_id,
            session_index: extract_text(&xml, "SessionIndex"),
        })
    }

    fn build_logout_response(
        &self,
        response_id: &str,
        in_response_to: Option<&str>,
        ct: Duration,
    ) -> String {
        let in_response_to = in_response_to
            .map(|id| format!(r#" InResponseTo="{id}""#))
            .unwrap_or_default();
        format!(
            r#"<samlp:LogoutResponse xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion" ID="{id}" Version="2.0" IssueInstant="{instant}" Destination="{dest}"{irt}><saml:Issuer>{issuer}</saml:Issuer><samlp:Status><samlp:StatusCode Value="urn:oasis:names:tc:SAML:2.0:status:Success"/></samlp:Status></samlp:LogoutResponse>"#,
            id = response_id,
            instant = Self::instant(ct),
            dest = self.config.idp_slo_url,
            irt = in_response_to,
            issuer = self.config.sp_entity_id,
        )
    }

    /// Signed Redirect-binding url answering an IdP's LogoutRequest.
    pub fn logout_response_redirect(
        &self,
        in_response_to: Option<&str>,
        relay_state: Option<&str>,
        ct: Duration,
    ) -> Result<Url, UpstreamError> {
        let response_id = format!("_{}", Uuid::new_v4().simple());
        let xml = self.build_logout_response(&response_id, in_response_to, ct);
        let payload = Self::deflate_b64(&xml)?;
        self.signed_redirect(
            &self.config.idp_slo_url,
            "SAMLResponse",
            &payload,
            relay_state,
        )
    }

    /// SP metadata document for IdP registration.
    pub fn metadata_xml(&self) -> String {
        let cert_b64 = B64_STANDARD.encode(
            X509::from_pem(self.config.sp_cert_pem.as_bytes())
                .and_then(|c| c.to_der())
                .unwrap_or_default(),
        );
        let service_names: String = self
            .config
            .service_names
            .iter()
            .map(|(lang, name)| {
                format!(r#"<mdui:DisplayName xml:lang="{lang}">{name}</mdui:DisplayName>"#)
            })
            .collect();
        format!(
            r#"<md:EntityDescriptor xmlns:md="urn:oasis:names:tc:SAML:2.0:metadata" xmlns:mdui="urn:oasis:names:tc:SAML:metadata:ui" entityID="{entity_id}"><md:SPSSODescriptor AuthnRequestsSigned="true" WantAssertionsSigned="true" protocolSupportEnumeration="urn:oasis:names:tc:SAML:2.0:protocol"><md:Extensions><mdui:UIInfo>{service_names}</mdui:UIInfo></md:Extensions><md:KeyDescriptor use="signing"><ds:KeyInfo xmlns:ds="http://www.w3.org/2000/09/xmldsig#"><ds:X509Data><ds:X509Certificate>{cert_b64}</ds:X509Certificate></ds:X509Data></ds:KeyInfo></md:KeyDescriptor><md:SingleLogoutService Binding="urn:oasis:names:tc:SAML:2.0:bindings:HTTP-Redirect" Location="{slo}"/><md:AssertionConsumerService Binding="urn:oasis:names:tc:SAML:2.0:bindings:HTTP-POST" Location="{acs}" index="0" isDefault="true"/></md:SPSSODescriptor></md:EntityDescriptor>"#,
            entity_id = self.config.sp_entity_id,
            slo = self.config.slo_url,
            acs = self.config.acs_url,
        )
    }

    // == response parsing ==

    /// Parse and verify a POST-bound Response document.
    pub fn parse_response(
        &self,
        b64_response: &str,
        expected_in_response_to: &str,
        ct: Duration,
    ) -> Result<SamlAssertion, UpstreamError> {
        let xml_bytes = B64_STANDARD
            .decode(b64_response.replace(['\n', '\r'], ""))
            .map_err(|_| UpstreamError::InvalidResponse("response is not base64".to_string()))?;
        let xml = String::from_utf8(xml_bytes)
            .map_err(|_| UpstreamError::InvalidResponse("response is not utf-8".to_string()))?;

        // Identity data is only read from the digest-verified element.
        // Response-level status and InResponseTo come from the envelope.
        let verified = self.verify_xml_signature(&xml)?;
        let parsed = parse_response_xml(&xml)?;
        let signed = parse_response_xml(&verified)?;

        if signed.issuer.as_deref() != Some(self.config.idp_entity_id.as_str()) {
            return Err(UpstreamError::InvalidResponse("issuer mismatch".to_string()));
        }
        if !parsed.status_success {
            return Err(UpstreamError::Denied);
        }
        if parsed.in_response_to.as_deref() != Some(expected_in_response_to) {
            return Err(UpstreamError::InvalidResponse(
                "InResponseTo mismatch".to_string(),
            ));
        }
        if let Some(audience) = signed.audience.as_deref() {
            if audience != self.config.sp_entity_id {
                return Err(UpstreamError::InvalidResponse(
                    "audience mismatch".to_string(),
                ));
            }
        }
        let now = ct.as_secs() as i64;
        if let Some(not_on_or_after) = signed.not_on_or_after {
            if now >= not_on_or_after {
                return Err(UpstreamError::InvalidResponse(
                    "assertion expired".to_string(),
                ));
            }
        }
        let name_id = signed
            .name_id
            .ok_or_else(|| UpstreamError::InvalidResponse("assertion without NameID".to_string()))?;

        Ok(SamlAssertion {
            name_id,
            session_index: signed.session_index,
            authn_context: signed.authn_context,
            attributes: signed.attributes,
        })
    }

    /// Verify the embedded XML signature: the certificate inside the
    /// document must be the pinned one, its key must verify the
    /// SignatureValue over the SignedInfo byte span, and the SignedInfo
    /// Reference digest must match the referenced element with the
    /// enveloped Signature removed. Returns that digest-verified element,
    /// the only part of the document the signature binds.
    fn verify_xml_signature(&self, xml: &str) -> Result<String, UpstreamError> {
        let signed_info = extract_span(xml, "SignedInfo").ok_or_else(|| {
            UpstreamError::InvalidResponse("response without SignedInfo".to_string())
        })?;
        let signature_value = extract_text(xml, "SignatureValue").ok_or_else(|| {
            UpstreamError::InvalidResponse("response without SignatureValue".to_string())
        })?;
        let embedded_cert = extract_text(xml, "X509Certificate").ok_or_else(|| {
            UpstreamError::InvalidResponse("response without certificate".to_string())
        })?;

        let embedded_der = B64_STANDARD
            .decode(embedded_cert.replace(['\n', '\r', ' '], ""))
            .map_err(|_| UpstreamError::SignatureInvalid)?;
        if embedded_der != self.idp_cert_der {
            security_error!("SAML response certificate does not match the pinned IdP certificate");
            return Err(UpstreamError::SignatureInvalid);
        }

        let signature = B64_STANDARD
            .decode(signature_value.replace(['\n', '\r', ' '], ""))
            .map_err(|_| UpstreamError::SignatureInvalid)?;
        let mut verifier = Verifier::new(MessageDigest::sha256(), &self.idp_key)
            .map_err(|_| UpstreamError::SignatureInvalid)?;
        match verifier.verify_oneshot(&signature, signed_info.as_bytes()) {
            Ok(true) => {}
            _ => return Err(UpstreamError::SignatureInvalid),
        }

        // The signature only binds what its Reference digest covers, so
        // the digest is recomputed over the referenced element.
        let digest_method =
            extract_attr(signed_info, "DigestMethod", "Algorithm").ok_or_else(|| {
                UpstreamError::InvalidResponse("SignedInfo without DigestMethod".to_string())
            })?;
        if !digest_method.ends_with("#sha256") {
            return Err(UpstreamError::InvalidResponse(
                "unsupported digest algorithm".to_string(),
            ));
        }
        let digest_value = extract_text(signed_info, "DigestValue").ok_or_else(|| {
            UpstreamError::InvalidResponse("SignedInfo without DigestValue".to_string())
        })?;
        let expected = B64_STANDARD
            .decode(digest_value.replace(['\n', '\r', ' '], ""))
            .map_err(|_| UpstreamError::SignatureInvalid)?;

        let reference_uri = extract_attr(signed_info, "Reference", "URI").ok_or_else(|| {
            UpstreamError::InvalidResponse("SignedInfo without Reference".to_string())
        })?;
        let referenced_id = reference_uri.strip_prefix('#').ok_or_else(|| {
            UpstreamError::InvalidResponse("unsupported reference uri".to_string())
        })?;
        let referenced = span_by_id(xml, referenced_id).ok_or_else(|| {
            security_error!("SAML signature references an element the document does not carry");
            UpstreamError::SignatureInvalid
        })?;

        // Enveloped-signature transform: the Signature element itself is
        // excluded from the digest input.
        let enveloped = match extract_span(referenced, "Signature") {
            Some(sig) => referenced.replacen(sig, "", 1),
            None => referenced.to_string(),
        };
        let digest = sha::sha256(enveloped.as_bytes());
        if digest.as_slice() != expected.as_slice() {
            security_error!("SAML reference digest does not match the signed element");
            return Err(UpstreamError::SignatureInvalid);
        }
        Ok(enveloped)
    }

    fn clean(&self, assertion: SamlAssertion) -> Result<CleanedAttributes, UpstreamError> {
        let single = |oid: &str| {
            assertion
                .attributes
                .get(oid)
                .and_then(|values| values.first())
                .cloned()
        };
        let uid = single(ATTR_ELECTRONIC_ID)
            .or_else(|| single(ATTR_NATIONAL_ID))
            .ok_or_else(|| {
                UpstreamError::InvalidResponse("assertion without an identifier".to_string())
            })?;

        // Finnish trust network authentication context maps onto eIDAS
        // assurance levels.
        let loa = assertion.authn_context.as_deref().map(|ctx| {
            if ctx.contains("loa3") {
                LOA_HIGH.to_string()
            } else if ctx.contains("loa2") {
                LOA_SUBSTANTIAL.to_string()
            } else {
                LOA_LOW.to_string()
            }
        });

        let mut extra = BTreeMap::new();
        extra.insert(
            "suomifi_name_id".to_string(),
            serde_json::Value::String(assertion.name_id.clone()),
        );
        if let Some(session_index) = assertion.session_index.clone() {
            extra.insert(
                "suomifi_session_index".to_string(),
                serde_json::Value::String(session_index),
            );
        }

        Ok(CleanedAttributes {
            uid,
            email: single(ATTR_EMAIL).map(|e| e.to_lowercase()),
            first_name: single(ATTR_GIVEN_NAME),
            last_name: single(ATTR_SURNAME),
            primary_sid: None,
            ad_groups: None,
            loa,
            github_username: None,
            uuid_hint: None,
            extra,
        })
    }
}

#[async_trait]
impl UpstreamProvider for SamlProvider {
    fn provider_id(&self) -> &str {
        &self.config.provider_id
    }

    async fn begin(&self, flow: &FlowState) -> Result<Url, UpstreamError> {
        // The flow state doubles as the AuthnRequest id checked against
        // InResponseTo at the ACS.
        let xml = self.build_authn_request(&flow.state, duration_from_epoch_now());
        let payload = Self::deflate_b64(&xml)?;
        self.signed_redirect(&self.config.idp_sso_url, "SAMLRequest", &payload, None)
    }

    async fn complete(
        &self,
        params: &CallbackParams,
        flow: &FlowState,
    ) -> Result<CleanedAttributes, UpstreamError> {
        let response = params.saml_response.as_deref().ok_or_else(|| {
            UpstreamError::InvalidResponse("ACS post without SAMLResponse".to_string())
        })?;
        let assertion = self.parse_response(response, &flow.state, duration_from_epoch_now())?;
        self.clean(assertion)
    }

    async fn single_logout_redirect(
        &self,
        session: &SessionData,
        _post_logout_redirect: &Url,
        relay_state: &str,
        ct: Duration,
    ) -> Option<Url> {
        // Without the NameID from login time the IdP cannot match the
        // session; there is nothing to send.
        let name_id = session.extra.get("suomifi_name_id")?.as_str()?;
        let session_index = session
            .extra
            .get("suomifi_session_index")
            .and_then(|v| v.as_str());
        match self.logout_redirect(name_id, session_index, relay_state, ct) {
            Ok(url) => Some(url),
            Err(err) => {
                admin_warn!(?err, "Failed to build saml single logout request");
                None
            }
        }
    }
}

// == helpers ==

fn urlencode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.as_bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(*byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

fn urldecode(value: &str) -> Option<String> {
    let mut out = Vec::with_capacity(value.len());
    let bytes = value.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let hex = bytes.get(i + 1..i + 3)?;
                let hex = std::str::from_utf8(hex).ok()?;
                out.push(u8::from_str_radix(hex, 16).ok()?);
                i += 3;
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8(out).ok()
}

/// The exact byte span of `<prefix:local ...>...</prefix:local>` for a
/// uniquely named element, prefix-agnostic.
fn extract_span<'a>(xml: &'a str, local: &str) -> Option<&'a str> {
    let open_at = find_element_start(xml, local)?;
    close_span(xml, open_at, local)
}

/// The element span starting at `open_at`, up to and including its close
/// tag, prefix-agnostic.
fn close_span<'a>(xml: &'a str, open_at: usize, local: &str) -> Option<&'a str> {
    let close_pat_ns = format!(":{local}");
    let close_at = xml[open_at..]
        .match_indices("</")
        .find_map(|(idx, _)| {
            let rest = &xml[open_at + idx..];
            let end = rest.find('>')? + 1;
            let tag = &rest[2..end - 1];
            (tag == local || tag.ends_with(&close_pat_ns)).then_some(open_at + idx + end)
        })?;
    Some(&xml[open_at..close_at])
}

/// Byte span of the element carrying the given signed-document id.
fn span_by_id<'a>(xml: &'a str, id: &str) -> Option<&'a str> {
    let marker = format!("ID=\"{id}\"");
    let attr_at = xml.find(&marker)?;
    let open_at = xml[..attr_at].rfind('<')?;
    let rest = &xml[open_at + 1..];
    let name_end = rest.find(|c: char| c.is_whitespace() || c == '>' || c == '/')?;
    let name = &rest[..name_end];
    let local = name.rsplit(':').next().unwrap_or(name);
    close_span(xml, open_at, local)
}

/// Value of an attribute on the first element with the given local name.
fn extract_attr(xml: &str, local: &str, attr: &str) -> Option<String> {
    let open_at = find_element_start(xml, local)?;
    let tag_end = xml[open_at..].find('>')? + open_at;
    let tag = &xml[open_at..tag_end];
    let marker = format!("{attr}=\"");
    let val_at = tag.find(&marker)? + marker.len();
    let val_end = tag[val_at..].find('"')? + val_at;
    Some(tag[val_at..val_end].to_string())
}

fn find_element_start(xml: &str, local: &str) -> Option<usize> {
    let mut search_from = 0;
    while let Some(rel) = xml[search_from..].find('<') {
        let at = search_from + rel;
        let rest = &xml[at + 1..];
        let name_end = rest
            .find(|c: char| c.is_whitespace() || c == '>' || c == '/')
            .unwrap_or(rest.len());
        let name = &rest[..name_end];
        let name_local = name.rsplit(':').next().unwrap_or(name);
        if name_local == local && !name.starts_with('/') {
            return Some(at);
        }
        search_from = at + 1;
    }
    None
}

/// Text content of a uniquely named element.
fn extract_text(xml: &str, local: &str) -> Option<String> {
    let span = extract_span(xml, local)?;
    let open_end = span.find('>')? + 1;
    let close_start = span.rfind("</")?;
    (open_end <= close_start).then(|| span[open_end..close_start].to_string())
}

#[derive(Default)]
struct ParsedResponse {
    issuer: Option<String>,
    status_success: bool,
    in_response_to: Option<String>,
    audience: Option<String>,
    not_on_or_after: Option<i64>,
    name_id: Option<String>,
    session_index: Option<String>,
    authn_context: Option<String>,
    attributes: BTreeMap<String, Vec<String>>,
}

fn parse_response_xml(xml: &str) -> Result<ParsedResponse, UpstreamError> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);
    let mut parsed = ParsedResponse::default();
    let mut path: Vec<String> = Vec::new();
    let mut current_attribute: Option<String> = None;

    loop {
        let event = reader.read_event();
        match &event {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                let local = name.rsplit(':').next().unwrap_or(&name).to_string();

                match local.as_str() {
                    "Response" => {
                        for attr in e.attributes().flatten() {
                            if attr.key.as_ref() == b"InResponseTo" {
                                parsed.in_response_to =
                                    String::from_utf8(attr.value.to_vec()).ok();
                            }
                        }
                    }
                    "StatusCode" => {
                        for attr in e.attributes().flatten() {
                            if attr.key.as_ref() == b"Value" {
                                let value = String::from_utf8_lossy(&attr.value);
                                if value.ends_with(":Success") {
                                    parsed.status_success = true;
                                }
                            }
                        }
                    }
                    "Conditions" => {
                        for attr in e.attributes().flatten() {
                            if attr.key.as_ref() == b"NotOnOrAfter" {
                                let value = String::from_utf8_lossy(&attr.value).to_string();
                                parsed.not_on_or_after = OffsetDateTime::parse(&value, &Rfc3339)
                                    .map(|t| t.unix_timestamp())
                                    .ok();
                            }
                        }
                    }
                    "AuthnStatement" => {
                        for attr in e.attributes().flatten() {
                            if attr.key.as_ref() == b"SessionIndex" {
                                parsed.session_index =
                                    String::from_utf8(attr.value.to_vec()).ok();
                            }
                        }
                    }
                    "Attribute" => {
                        for attr in e.attributes().flatten() {
                            if attr.key.as_ref() == b"Name" {
                                current_attribute = String::from_utf8(attr.value.to_vec()).ok();
                            }
                        }
                    }
                    _ => {}
                }
                // Self-closing elements never see a matching End event.
                if matches!(&event, Ok(Event::Start(_))) {
                    path.push(local);
                }
            }
            Ok(Event::End(_)) => {
                if let Some(ended) = path.pop() {
                    if ended == "Attribute" {
                        current_attribute = None;
                    }
                }
            }
            Ok(Event::Text(text)) => {
                let value = text
                    .unescape()
                    .map_err(|_| {
                        UpstreamError::InvalidResponse("response is not valid xml".to_string())
                    })?
                    .to_string();
                match path.last().map(String::as_str) {
                    Some("Issuer") if parsed.issuer.is_none() => parsed.issuer = Some(value),
                    Some("Audience") => parsed.audience = Some(value),
                    Some("NameID") => parsed.name_id = Some(value),
                    Some("AuthnContextClassRef") => parsed.authn_context = Some(value),
                    Some("AttributeValue") => {
                        if let Some(name) = current_attribute.as_ref() {
                            parsed.attributes.entry(name.clone()).or_default().push(value);
                        }
                    }
                    _ => {}
                }
            }
            Ok(Event::Eof) => break,
            Err(_) => {
                return Err(UpstreamError::InvalidResponse(
                    "response is not valid xml".to_string(),
                ))
            }
            _ => {}
        }
    }
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use openssl::rsa::Rsa;

    fn self_signed() -> (PKey<Private>, String) {
        use openssl::asn1::Asn1Time;
        use openssl::bn::BigNum;

        let rsa = Rsa::generate(2048).expect("keygen failed");
        let pkey = PKey::from_rsa(rsa).expect("pkey failed");
        let mut name = openssl::x509::X509NameBuilder::new().expect("name failed");
        name.append_entry_by_text("CN", "test").expect("cn failed");
        let name = name.build();
        let mut builder = openssl::x509::X509Builder::new().expect("builder failed");
        builder.set_version(2).expect("version failed");
        let serial = BigNum::from_u32(1)
            .and_then(|bn| bn.to_asn1_integer())
            .expect("serial failed");
        builder.set_serial_number(&serial).expect("serial failed");
        builder.set_subject_name(&name).expect("subject failed");
        builder.set_issuer_name(&name).expect("issuer failed");
        builder
            .set_not_before(&Asn1Time::days_from_now(0).expect("time failed"))
            .expect("not before failed");
        builder
            .set_not_after(&Asn1Time::days_from_now(365).expect("time failed"))
            .expect("not after failed");
        builder.set_pubkey(&pkey).expect("pubkey failed");
        builder
            .sign(&pkey, MessageDigest::sha256())
            .expect("sign failed");
        let pem = String::from_utf8(builder.build().to_pem().expect("pem failed"))
            .expect("utf8 failed");
        (pkey, pem)
    }

    fn test_provider() -> (SamlProvider, PKey<Private>) {
        let (sp_key, sp_cert) = self_signed();
        let (idp_key, idp_cert) = self_signed();
        let sp_key_pem = String::from_utf8(
            sp_key.private_key_to_pem_pkcs8().expect("pem failed"),
        )
        .expect("utf8 failed");
        let provider = SamlProvider::new(SamlConfig {
            provider_id: "suomifi".to_string(),
            sp_entity_id: "https://sso.example.com/saml/metadata".to_string(),
            acs_url: Url::parse("https://sso.example.com/saml/acs").expect("bad url"),
            slo_url: Url::parse("https://sso.example.com/saml/sls").expect("bad url"),
            idp_entity_id: "https://idp.example.fi".to_string(),
            idp_sso_url: Url::parse("https://idp.example.fi/sso").expect("bad url"),
            idp_slo_url: Url::parse("https://idp.example.fi/slo").expect("bad url"),
            idp_cert_pem: idp_cert,
            sp_key_pem,
            sp_cert_pem: sp_cert,
            service_names: [("fi".to_string(), "Tunnistamo".to_string())]
                .into_iter()
                .collect(),
        })
        .expect("provider failed");
        (provider, idp_key)
    }

    #[test]
    fn test_authn_request_redirect_roundtrip() {
        let (provider, _) = test_provider();
        let flow = FlowState {
            state: "_req1".to_string(),
            nonce: "n".to_string(),
            redirect_uri: provider.config.acs_url.clone(),
            original_client_id: None,
        };
        let rt = tokio::runtime::Builder::new_current_thread()
            .build()
            .expect("runtime failed");
        let url = rt.block_on(provider.begin(&flow)).expect("begin failed");
        assert!(url.as_str().starts_with("https://idp.example.fi/sso?"));

        let query = url.query().expect("no query");
        let payload = query
            .split('&')
            .find_map(|p| p.strip_prefix("SAMLRequest="))
            .expect("no SAMLRequest");
        let xml =
            SamlProvider::inflate_b64(&urldecode(payload).expect("decode failed"))
                .expect("inflate failed");
        assert!(xml.contains(r#"ID="_req1""#));
        assert!(xml.contains("https://sso.example.com/saml/metadata"));
        assert!(query.contains("SigAlg="));
        assert!(query.contains("Signature="));
    }

    #[test]
    fn test_redirect_signature_verification() {
        // Sign with the "IdP" key so the SP-side verification accepts it,
        // by building a provider whose sp key is our idp key.
        let (provider, idp_key) = test_provider();
        let payload = SamlProvider::deflate_b64("<samlp:LogoutResponse/>").expect("encode failed");
        let mut query = format!("SAMLResponse={}", urlencode(&payload));
        query.push_str(&format!("&SigAlg={}", urlencode(SIG_RSA_SHA256)));
        let mut signer =
            Signer::new(MessageDigest::sha256(), &idp_key).expect("signer failed");
        let signature = signer
            .sign_oneshot_to_vec(query.as_bytes())
            .expect("sign failed");
        let good = format!(
            "{query}&Signature={}",
            urlencode(&B64_STANDARD.encode(&signature))
        );
        assert!(provider.verify_redirect_signature(&good).is_ok());

        // Bit-flipped signature fails.
        let mut bad_sig = signature.clone();
        bad_sig[0] ^= 0xff;
        let bad = format!(
            "{query}&Signature={}",
            urlencode(&B64_STANDARD.encode(&bad_sig))
        );
        assert!(provider.verify_redirect_signature(&bad).is_err());
    }

    fn response_xml(signed_info: &str) -> String {
        format!(
            r#"<samlp:Response xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion" InResponseTo="_req1"><saml:Issuer>https://idp.example.fi</saml:Issuer><ds:Signature xmlns:ds="http://www.w3.org/2000/09/xmldsig#">{signed_info}<ds:SignatureValue>SIGVALUE</ds:SignatureValue><ds:KeyInfo><ds:X509Data><ds:X509Certificate>CERT</ds:X509Certificate></ds:X509Data></ds:KeyInfo></ds:Signature><samlp:Status><samlp:StatusCode Value="urn:oasis:names:tc:SAML:2.0:status:Success"/></samlp:Status><saml:Assertion><saml:Subject><saml:NameID>AAdzZWNyZXQx</saml:NameID></saml:Subject><saml:Conditions NotOnOrAfter="2030-01-01T00:00:00Z"><saml:AudienceRestriction><saml:Audience>https://sso.example.com/saml/metadata</saml:Audience></saml:AudienceRestriction></saml:Conditions><saml:AuthnStatement SessionIndex="_sess1"><saml:AuthnContext><saml:AuthnContextClassRef>http://ftn.ficora.fi/2017/loa2</saml:AuthnContextClassRef></saml:AuthnContext></saml:AuthnStatement><saml:AttributeStatement><saml:Attribute Name="urn:oid:1.2.246.22"><saml:AttributeValue>010101-0101</saml:AttributeValue></saml:Attribute><saml:Attribute Name="urn:oid:2.5.4.42"><saml:AttributeValue>Matti</saml:AttributeValue></saml:Attribute><saml:Attribute Name="urn:oid:2.5.4.4"><saml:AttributeValue>Meikalainen</saml:AttributeValue></saml:Attribute></saml:AttributeStatement></saml:Assertion></samlp:Response>"#
        )
    }

    #[test]
    fn test_response_structure_parsing() {
        let xml = response_xml(r#"<ds:SignedInfo>x</ds:SignedInfo>"#);
        let parsed = parse_response_xml(&xml).expect("parse failed");
        assert_eq!(parsed.issuer.as_deref(), Some("https://idp.example.fi"));
        assert!(parsed.status_success);
        assert_eq!(parsed.in_response_to.as_deref(), Some("_req1"));
        assert_eq!(
            parsed.audience.as_deref(),
            Some("https://sso.example.com/saml/metadata")
        );
        assert_eq!(parsed.name_id.as_deref(), Some("AAdzZWNyZXQx"));
        assert_eq!(parsed.session_index.as_deref(), Some("_sess1"));
        assert_eq!(
            parsed.attributes.get("urn:oid:2.5.4.42"),
            Some(&vec!["Matti".to_string()])
        );
    }

    #[test]
    fn test_clean_maps_loa_and_names() {
        let (provider, _) = test_provider();
        let mut attributes = BTreeMap::new();
        attributes.insert(ATTR_ELECTRONIC_ID.to_string(), vec!["e-123".to_string()]);
        attributes.insert(ATTR_GIVEN_NAME.to_string(), vec!["Matti".to_string()]);
        attributes.insert(ATTR_SURNAME.to_string(), vec!["Meikalainen".to_string()]);
        let attrs = provider
            .clean(SamlAssertion {
                name_id: "n".to_string(),
                session_index: Some("_s".to_string()),
                authn_context: Some("http://ftn.ficora.fi/2017/loa2".to_string()),
                attributes,
            })
            .expect("clean failed");
        assert_eq!(attrs.uid, "e-123");
        assert_eq!(attrs.loa.as_deref(), Some(LOA_SUBSTANTIAL));
        assert_eq!(attrs.first_name.as_deref(), Some("Matti"));

        // No identifier attribute at all is a hard failure.
        let (provider, _) = test_provider();
        assert!(provider
            .clean(SamlAssertion {
                name_id: "n".to_string(),
                session_index: None,
                authn_context: None,
                attributes: BTreeMap::new(),
            })
            .is_err());
    }

    /// A Response signed the way the IdP signs: enveloped signature over
    /// the Response element, digest computed with the Signature removed.
    fn signed_response(idp_key: &PKey<Private>, idp_cert_pem: &str) -> String {
        let pre = r#"<samlp:Response xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion" ID="_resp1" InResponseTo="_req1"><saml:Issuer>https://idp.example.fi</saml:Issuer>"#;
        let post = r#"<samlp:Status><samlp:StatusCode Value="urn:oasis:names:tc:SAML:2.0:status:Success"/></samlp:Status><saml:Assertion><saml:Subject><saml:NameID>AAdzZWNyZXQx</saml:NameID></saml:Subject><saml:Conditions NotOnOrAfter="2030-01-01T00:00:00Z"><saml:AudienceRestriction><saml:Audience>https://sso.example.com/saml/metadata</saml:Audience></saml:AudienceRestriction></saml:Conditions><saml:AuthnStatement SessionIndex="_sess1"><saml:AuthnContext><saml:AuthnContextClassRef>http://ftn.ficora.fi/2017/loa2</saml:AuthnContextClassRef></saml:AuthnContext></saml:AuthnStatement><saml:AttributeStatement><saml:Attribute Name="urn:oid:1.2.246.22"><saml:AttributeValue>010101-0101</saml:AttributeValue></saml:Attribute></saml:AttributeStatement></saml:Assertion></samlp:Response>"#;

        let digest = sha::sha256(format!("{pre}{post}").as_bytes());
        let signed_info = format!(
            r##"<ds:SignedInfo><ds:CanonicalizationMethod Algorithm="http://www.w3.org/2001/10/xml-exc-c14n#"/><ds:SignatureMethod Algorithm="{SIG_RSA_SHA256}"/><ds:Reference URI="#_resp1"><ds:Transforms><ds:Transform Algorithm="http://www.w3.org/2000/09/xmldsig#enveloped-signature"/></ds:Transforms><ds:DigestMethod Algorithm="http://www.w3.org/2001/04/xmlenc#sha256"/><ds:DigestValue>{}</ds:DigestValue></ds:Reference></ds:SignedInfo>"##,
            B64_STANDARD.encode(digest)
        );
        let mut signer = Signer::new(MessageDigest::sha256(), idp_key).expect("signer failed");
        let signature = signer
            .sign_oneshot_to_vec(signed_info.as_bytes())
            .expect("sign failed");
        let cert_b64 = B64_STANDARD.encode(
            X509::from_pem(idp_cert_pem.as_bytes())
                .and_then(|c| c.to_der())
                .expect("cert failed"),
        );
        format!(
            r#"{pre}<ds:Signature xmlns:ds="http://www.w3.org/2000/09/xmldsig#">{signed_info}<ds:SignatureValue>{}</ds:SignatureValue><ds:KeyInfo><ds:X509Data><ds:X509Certificate>{cert_b64}</ds:X509Certificate></ds:X509Data></ds:KeyInfo></ds:Signature>{post}"#,
            B64_STANDARD.encode(&signature)
        )
    }

    #[test]
    fn test_response_verification_accepts_signed_document() {
        let (provider, idp_key) = test_provider();
        let xml = signed_response(&idp_key, &provider.config.idp_cert_pem);
        let assertion = provider
            .parse_response(
                &B64_STANDARD.encode(&xml),
                "_req1",
                Duration::from_secs(1_700_000_000),
            )
            .expect("verification failed");
        assert_eq!(assertion.name_id, "AAdzZWNyZXQx");
        assert_eq!(
            assertion.attributes.get("urn:oid:1.2.246.22"),
            Some(&vec!["010101-0101".to_string()])
        );
    }

    #[test]
    fn test_response_signature_binds_document_content() {
        let (provider, idp_key) = test_provider();
        let xml = signed_response(&idp_key, &provider.config.idp_cert_pem);
        let ct = Duration::from_secs(1_700_000_000);

        // A captured Signature block cannot be reused over altered
        // identity content: the reference digest stops it.
        let forged = xml.replace("AAdzZWNyZXQx", "ATTACKER-CHOSEN");
        let out = provider.parse_response(&B64_STANDARD.encode(&forged), "_req1", ct);
        assert!(matches!(out, Err(UpstreamError::SignatureInvalid)));

        let forged = xml.replace("010101-0101", "020202-0202");
        let out = provider.parse_response(&B64_STANDARD.encode(&forged), "_req1", ct);
        assert!(matches!(out, Err(UpstreamError::SignatureInvalid)));

        // A tampered SignedInfo fails the signature itself.
        let forged = xml.replace("#_resp1", "#_other");
        let out = provider.parse_response(&B64_STANDARD.encode(&forged), "_req1", ct);
        assert!(matches!(out, Err(UpstreamError::SignatureInvalid)));
    }

    #[test]
    fn test_logout_request_parsing() {
        let xml = r#"<samlp:LogoutRequest xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion" ID="_slo1" Version="2.0"><saml:Issuer>https://idp.example.fi</saml:Issuer><saml:NameID>AAdzZWNyZXQx</saml:NameID><samlp:SessionIndex>_sess1</samlp:SessionIndex></samlp:LogoutRequest>"#;
        let payload = SamlProvider::deflate_b64(xml).expect("encode failed");
        let slo = SamlProvider::parse_logout_request(&payload).expect("parse failed");
        assert_eq!(slo.request_id.as_deref(), Some("_slo1"));
        assert_eq!(slo.name_id, "AAdzZWNyZXQx");
        assert_eq!(slo.session_index.as_deref(), Some("_sess1"));
    }

    #[test]
    fn test_span_extraction() {
        let xml = response_xml(r#"<ds:SignedInfo Id="si">content</ds:SignedInfo>"#);
        let span = extract_span(&xml, "SignedInfo").expect("span missing");
        assert_eq!(span, r#"<ds:SignedInfo Id="si">content</ds:SignedInfo>"#);
        assert_eq!(
            extract_text(&xml, "SignatureValue").as_deref(),
            Some("SIGVALUE")
        );
    }
}

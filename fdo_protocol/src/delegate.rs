//! Delegation of the owner role through X.509 certificate chains. Each
//! certificate carries function OIDs naming the roles its holder may perform,
//! and optionally a named identifier (leaf) or identifier constraints (CA)
//! scoping which identities the subtree below may represent.
//!
//! Certificate expiration and revocation are not checked here; deployments
//! layer those on according to their own policy.

use tracing::debug;
use x509_parser::{
    der_parser::{oid, oid::Oid},
    prelude::{FromDer, X509Certificate},
};

use crate::{
    keys::{KeyError, PublicVerifier, SignatureAlgorithm},
    publickey::{verifier_from_spki, PublicKeyError, X5Chain},
};

pub const IDENTIFIER_OID: Oid<'static> = oid!(1.3.6.1.4.1.45724.99.2.1);
pub const IDENTIFIER_CONSTRAINTS_OID: Oid<'static> = oid!(1.3.6.1.4.1.45724.99.2.2);

#[derive(thiserror::Error, Debug)]
pub enum DelegateError {
    #[error("chain is empty")]
    EmptyChain,
    #[error("certificate {0} failed to parse: {1}")]
    CertificateParsing(usize, String),
    #[error("signature of certificate {0} does not verify against its issuer")]
    SignatureInvalid(usize),
    #[error("certificate {0} does not carry function {1}")]
    MissingFunction(usize, DelegateFunction),
    #[error("certificate {0} lacks the required key usage")]
    KeyUsage(usize),
    #[error("certificate {0} is not a CA")]
    NotCa(usize),
    #[error("identifier {identifier:?} is not permitted by constraints {constraints:?}")]
    IdentifierNotPermitted { identifier: String, constraints: String },
    #[error("identifier extension of certificate {0} is not valid UTF-8")]
    IdentifierEncoding(usize),
    #[error("unsupported signature algorithm on certificate {0}")]
    UnsupportedSignature(usize),
    #[error(transparent)]
    PublicKey(#[from] PublicKeyError),
    #[error(transparent)]
    Key(#[from] KeyError),
}

/// The delegable roles, each with its own object identifier under the
/// function arc.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum DelegateFunction {
    Onboard,
    Redirect,
    Upload,
    Claim,
    Provision,
    Extend,
}

impl DelegateFunction {
    pub fn oid(&self) -> Oid<'static> {
        match self {
            DelegateFunction::Onboard => oid!(1.3.6.1.4.1.45724.99.1.1),
            DelegateFunction::Redirect => oid!(1.3.6.1.4.1.45724.99.1.2),
            DelegateFunction::Upload => oid!(1.3.6.1.4.1.45724.99.1.3),
            DelegateFunction::Claim => oid!(1.3.6.1.4.1.45724.99.1.4),
            DelegateFunction::Provision => oid!(1.3.6.1.4.1.45724.99.1.5),
            DelegateFunction::Extend => oid!(1.3.6.1.4.1.45724.99.1.6),
        }
    }
}

/// Matches one identifier term against one pattern term, `*` matching any
/// substring within the term.
pub fn is_permitted_identifier_rule(identifier: &str, pattern: &str) -> bool {
    // Standard backtracking wildcard match over bytes.
    let text = identifier.as_bytes();
    let pat = pattern.as_bytes();
    let (mut t, mut p) = (0usize, 0usize);
    let (mut star, mut mark) = (None::<usize>, 0usize);

    while t < text.len() {
        if p < pat.len() && (pat[p] == text[t]) {
            t += 1;
            p += 1;
        } else if p < pat.len() && pat[p] == b'*' {
            star = Some(p);
            mark = t;
            p += 1;
        } else if let Some(s) = star {
            p = s + 1;
            mark += 1;
            t = mark;
        } else {
            return false;
        }
    }
    while p < pat.len() && pat[p] == b'*' {
        p += 1;
    }
    p == pat.len()
}

/// Whether `identifier` is permitted by the constraint set `patterns`: every
/// comma-separated term of the identifier must match at least one term of the
/// patterns.
pub fn is_permitted_identifier(identifier: &str, patterns: &str) -> bool {
    identifier.split(',').all(|term| {
        let term = term.trim();
        patterns
            .split(',')
            .any(|pattern| is_permitted_identifier_rule(term, pattern.trim()))
    })
}

/// Outcome of a successful chain verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelegateVerification {
    /// The named identifier the leaf declares, if any.
    pub leaf_identifier: Option<String>,
}

fn extension_utf8(cert: &X509Certificate, oid: &Oid, index: usize) -> Result<Option<String>, DelegateError> {
    let ext = cert
        .get_extension_unique(oid)
        .map_err(|e| DelegateError::CertificateParsing(index, e.to_string()))?;
    ext.map(|ext| {
        std::str::from_utf8(ext.value)
            .map(str::to_string)
            .map_err(|_| DelegateError::IdentifierEncoding(index))
    })
    .transpose()
}

fn has_extension(cert: &X509Certificate, oid: &Oid, index: usize) -> Result<bool, DelegateError> {
    Ok(cert
        .get_extension_unique(oid)
        .map_err(|e| DelegateError::CertificateParsing(index, e.to_string()))?
        .is_some())
}

/// Verifies an X.509 signature (DER ECDSA or PKCS#1 RSA) against `issuer`,
/// converting to the raw form the key abstraction verifies.
fn verify_x509_signature(cert: &X509Certificate, issuer: &PublicVerifier, index: usize) -> Result<(), DelegateError> {
    let tbs = cert.tbs_certificate.as_ref();
    let signature = cert.signature_value.data.as_ref();

    use p256::ecdsa::signature::SignatureEncoding;

    let result = match issuer {
        PublicVerifier::EcP256(_) => p256::ecdsa::Signature::from_der(signature)
            .map_err(|_| KeyError::Verification)
            .and_then(|sig| issuer.verify(SignatureAlgorithm::ES256, tbs, &sig.to_vec())),
        PublicVerifier::EcP384(_) => p384::ecdsa::Signature::from_der(signature)
            .map_err(|_| KeyError::Verification)
            .and_then(|sig| issuer.verify(SignatureAlgorithm::ES384, tbs, &sig.to_vec())),
        PublicVerifier::Rsa { .. } => issuer.verify(issuer.algorithm(), tbs, signature),
    };
    result.map_err(|_| DelegateError::SignatureInvalid(index))
}

fn check_key_usage(cert: &X509Certificate, is_leaf: bool, index: usize) -> Result<(), DelegateError> {
    let key_usage = cert
        .key_usage()
        .map_err(|e| DelegateError::CertificateParsing(index, e.to_string()))?
        .ok_or(DelegateError::KeyUsage(index))?;

    if !key_usage.value.digital_signature() {
        return Err(DelegateError::KeyUsage(index));
    }
    if !is_leaf {
        if !key_usage.value.key_cert_sign() {
            return Err(DelegateError::KeyUsage(index));
        }
        let basic = cert
            .basic_constraints()
            .map_err(|e| DelegateError::CertificateParsing(index, e.to_string()))?
            .ok_or(DelegateError::NotCa(index))?;
        if !basic.value.ca {
            return Err(DelegateError::NotCa(index));
        }
    }
    Ok(())
}

/// Verifies a delegate chain (leaf first) for `function`.
///
/// - Every certificate must carry the function OID, the root included.
/// - Each certificate's signature is checked against the next one; the root
///   is checked against `owner_key` when given (the voucher's current owner
///   acting as trust anchor even without a certificate of its own), otherwise
///   against itself.
/// - Identifier constraints propagate: each child identifier or constraint
///   set must be permitted at every ancestor that declares constraints, and
///   `expected_identifier` (when given) must be permitted by the root's
///   constraints.
pub fn verify_chain(
    chain: &X5Chain,
    function: DelegateFunction,
    owner_key: Option<&PublicVerifier>,
    expected_identifier: Option<&str>,
) -> Result<DelegateVerification, DelegateError> {
    if chain.0.is_empty() {
        return Err(DelegateError::EmptyChain);
    }

    let parsed: Vec<X509Certificate> = chain
        .0
        .iter()
        .enumerate()
        .map(|(index, der)| {
            X509Certificate::from_der(der)
                .map(|(_, cert)| cert)
                .map_err(|e| DelegateError::CertificateParsing(index, e.to_string()))
        })
        .collect::<Result<_, _>>()?;

    let function_oid = function.oid();
    let last = parsed.len() - 1;
    let mut leaf_identifier = None;
    // The most recent identifier or constraint value seen walking rootwards.
    let mut child_value: Option<String> = None;

    for (index, cert) in parsed.iter().enumerate() {
        let is_leaf = index == 0;

        let issuer = match parsed.get(index + 1) {
            Some(issuer_cert) => verifier_from_spki(issuer_cert.public_key().raw)?,
            None => match owner_key {
                // The owner holds only a key: treat it as the trust anchor
                // the root must be signed by.
                Some(owner) => owner.clone(),
                None => verifier_from_spki(cert.public_key().raw)?,
            },
        };
        verify_x509_signature(cert, &issuer, index)?;
        check_key_usage(cert, is_leaf, index)?;

        if !has_extension(cert, &function_oid, index)? {
            return Err(DelegateError::MissingFunction(index, function));
        }

        if is_leaf {
            leaf_identifier = extension_utf8(cert, &IDENTIFIER_OID, index)?;
            child_value = leaf_identifier.clone();
        }

        if let Some(constraints) = extension_utf8(cert, &IDENTIFIER_CONSTRAINTS_OID, index)? {
            if !is_leaf {
                if let Some(child) = &child_value {
                    if !is_permitted_identifier(child, &constraints) {
                        return Err(DelegateError::IdentifierNotPermitted {
                            identifier: child.clone(),
                            constraints,
                        });
                    }
                }
                if index == last {
                    if let Some(expected) = expected_identifier {
                        if !is_permitted_identifier(expected, &constraints) {
                            return Err(DelegateError::IdentifierNotPermitted {
                                identifier: expected.to_string(),
                                constraints,
                            });
                        }
                    }
                }
                child_value = Some(constraints);
            }
        }
    }

    debug!(
        "delegate chain OK for {function}: {} certificates, leaf identifier {leaf_identifier:?}",
        parsed.len()
    );
    Ok(DelegateVerification { leaf_identifier })
}

#[cfg(any(test, feature = "generate"))]
pub mod generate {
    //! Delegate chain generation, for owner tooling and tests.

    use rcgen::{
        BasicConstraints, CertificateParams, CustomExtension, DistinguishedName, DnType, IsCa, KeyUsagePurpose,
    };

    use crate::keys::KeyPair;

    use super::*;

    #[derive(thiserror::Error, Debug)]
    pub enum GenerateError {
        #[error("certificate generation failed: {0}")]
        Rcgen(#[from] rcgen::Error),
        #[error(transparent)]
        Key(#[from] KeyError),
    }

    /// One link of a chain under construction, root first.
    pub struct ChainLink<'a> {
        pub common_name: &'a str,
        /// Identifier constraints for CA links; the named identifier for the leaf.
        pub identifier: Option<&'a str>,
    }

    /// Arc under which the delegation extensions live.
    const FUNCTION_ARC: [u64; 9] = [1, 3, 6, 1, 4, 1, 45724, 99, 1];

    fn function_extension(function: &DelegateFunction) -> CustomExtension {
        let mut components = FUNCTION_ARC.to_vec();
        components.push(match function {
            DelegateFunction::Onboard => 1,
            DelegateFunction::Redirect => 2,
            DelegateFunction::Upload => 3,
            DelegateFunction::Claim => 4,
            DelegateFunction::Provision => 5,
            DelegateFunction::Extend => 6,
        });
        CustomExtension::from_oid_content(&components, Vec::new())
    }

    fn identifier_extension(oid: &[u64], value: &str) -> CustomExtension {
        CustomExtension::from_oid_content(oid, value.as_bytes().to_vec())
    }

    const IDENTIFIER_OID_COMPONENTS: [u64; 10] = [1, 3, 6, 1, 4, 1, 45724, 99, 2, 1];
    const CONSTRAINTS_OID_COMPONENTS: [u64; 10] = [1, 3, 6, 1, 4, 1, 45724, 99, 2, 2];

    fn link_params(
        link: &ChainLink,
        is_leaf: bool,
        functions: &[DelegateFunction],
    ) -> Result<CertificateParams, GenerateError> {
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, link.common_name);
        params.distinguished_name = dn;

        if is_leaf {
            params.is_ca = IsCa::ExplicitNoCa;
            params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        } else {
            params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
            params.key_usages = vec![KeyUsagePurpose::DigitalSignature, KeyUsagePurpose::KeyCertSign];
        }

        params.custom_extensions = functions.iter().map(function_extension).collect();
        if let Some(identifier) = link.identifier {
            let oid = if is_leaf {
                &IDENTIFIER_OID_COMPONENTS
            } else {
                &CONSTRAINTS_OID_COMPONENTS
            };
            params.custom_extensions.push(identifier_extension(oid, identifier));
        }
        Ok(params)
    }

    /// Generates a delegate chain: the first link becomes the root, signed
    /// directly by `owner_key` so the owner is the chain's trust anchor; each
    /// following link is signed by the previous one. Returns the chain (leaf
    /// first) and the leaf's private key.
    pub fn generate_chain(
        owner_key: &KeyPair,
        links: &[ChainLink],
        functions: &[DelegateFunction],
    ) -> Result<(X5Chain, KeyPair), GenerateError> {
        assert!(!links.is_empty(), "a chain needs at least one link");

        // The owner's certificate exists only to act as issuer of the root;
        // it is not part of the emitted chain.
        let owner_rcgen = rcgen::KeyPair::try_from(owner_key.to_pkcs8_der()?.as_slice())?;
        let owner_params = {
            let mut params = CertificateParams::default();
            let mut dn = DistinguishedName::new();
            dn.push(DnType::CommonName, "owner");
            params.distinguished_name = dn;
            params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
            params
        };
        let owner_cert = owner_params.self_signed(&owner_rcgen)?;

        let mut ders: Vec<Vec<u8>> = Vec::with_capacity(links.len());
        let mut issuer_cert = owner_cert;
        let mut issuer_key = owner_rcgen;
        let mut leaf_key = None;

        for (index, link) in links.iter().enumerate() {
            let is_leaf = index == links.len() - 1;
            let params = link_params(link, is_leaf, functions)?;

            let subject_keypair = KeyPair::random_p256();
            let subject_rcgen = rcgen::KeyPair::try_from(subject_keypair.to_pkcs8_der()?.as_slice())?;

            let cert = params.signed_by(&subject_rcgen, &issuer_cert, &issuer_key)?;
            ders.push(cert.der().to_vec());

            if is_leaf {
                leaf_key = Some(subject_keypair);
            } else {
                issuer_cert = cert;
                issuer_key = subject_rcgen;
            }
        }

        ders.reverse();
        Ok((X5Chain::new(ders), leaf_key.expect("links is non-empty")))
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use rstest::rstest;

    use crate::keys::KeyPair;

    use super::{generate::*, *};

    #[rstest]
    #[case("DNS:subsub.sub.dom", "DNS:*.dom", true)]
    #[case("DNS:*.dom", "DNS:*.sub.dom", false)]
    #[case("ID:1234-1111", "ID:*-1111", true)]
    #[case("ID:1234-1112", "ID:*-1111", false)]
    #[case("DNS:srv.dom", "DNS:srv.dom", true)]
    #[case("DNS:srv.dom", "*", true)]
    fn identifier_rule(#[case] identifier: &str, #[case] pattern: &str, #[case] expected: bool) {
        assert_eq!(is_permitted_identifier_rule(identifier, pattern), expected);
    }

    #[test]
    fn identifier_rule_is_reflexive() {
        for id in ["DNS:a.b.c", "ID:1234", "DNS:*.dom"] {
            assert!(is_permitted_identifier_rule(id, id));
        }
    }

    #[test]
    fn identifier_alternatives() {
        // Matching any one comma-separated alternative suffices.
        assert!(is_permitted_identifier("DNS:x.a", "DNS:*.a,DNS:*.b"));
        assert!(is_permitted_identifier("DNS:x.b", "DNS:*.a,DNS:*.b"));
        assert!(!is_permitted_identifier("DNS:x.c", "DNS:*.a,DNS:*.b"));
        // Every term of a compound identifier must be permitted.
        assert!(is_permitted_identifier("DNS:x.a,DNS:y.b", "DNS:*.a,DNS:*.b"));
        assert!(!is_permitted_identifier("DNS:x.a,DNS:y.c", "DNS:*.a,DNS:*.b"));
    }

    fn generate(links: &[ChainLink], owner_key: &KeyPair, functions: &[DelegateFunction]) -> X5Chain {
        let (chain, _) = generate_chain(owner_key, links, functions).unwrap();
        chain
    }

    #[test]
    fn good_chain_verifies() {
        let owner_key = KeyPair::random_p256();
        let chain = generate(
            &[
                ChainLink {
                    common_name: "root",
                    identifier: Some("DNS:*.sub.dom1,DNS:*.sub.dom2"),
                },
                ChainLink {
                    common_name: "intermediate",
                    identifier: Some("DNS:*.sub.sub.dom1"),
                },
                ChainLink {
                    common_name: "server",
                    identifier: Some("DNS:srv.sub.sub.dom1"),
                },
            ],
            &owner_key,
            &[DelegateFunction::Onboard],
        );

        let verification = verify_chain(
            &chain,
            DelegateFunction::Onboard,
            Some(&owner_key.verifying_key()),
            None,
        )
        .unwrap();
        assert_eq!(verification.leaf_identifier.as_deref(), Some("DNS:srv.sub.sub.dom1"));
    }

    #[test]
    fn leaf_outside_constraints_is_rejected() {
        let owner_key = KeyPair::random_p256();
        let chain = generate(
            &[
                ChainLink {
                    common_name: "root",
                    identifier: Some("DNS:*.sub.dom1,DNS:*.sub.dom2"),
                },
                ChainLink {
                    common_name: "intermediate",
                    identifier: Some("DNS:*.sub.sub.dom1"),
                },
                ChainLink {
                    common_name: "server",
                    identifier: Some("DNS:srv.sub.sub.dom2"),
                },
            ],
            &owner_key,
            &[DelegateFunction::Onboard],
        );

        assert_matches!(
            verify_chain(
                &chain,
                DelegateFunction::Onboard,
                Some(&owner_key.verifying_key()),
                None,
            ),
            Err(DelegateError::IdentifierNotPermitted { .. })
        );
    }

    #[test]
    fn missing_function_is_rejected() {
        let owner_key = KeyPair::random_p256();
        let chain = generate(
            &[
                ChainLink {
                    common_name: "root",
                    identifier: None,
                },
                ChainLink {
                    common_name: "server",
                    identifier: None,
                },
            ],
            &owner_key,
            &[DelegateFunction::Redirect],
        );

        assert_matches!(
            verify_chain(
                &chain,
                DelegateFunction::Onboard,
                Some(&owner_key.verifying_key()),
                None,
            ),
            Err(DelegateError::MissingFunction(0, DelegateFunction::Onboard))
        );
    }

    #[test]
    fn wrong_owner_key_is_rejected() {
        let owner_key = KeyPair::random_p256();
        let chain = generate(
            &[
                ChainLink {
                    common_name: "root",
                    identifier: None,
                },
                ChainLink {
                    common_name: "server",
                    identifier: None,
                },
            ],
            &owner_key,
            &[DelegateFunction::Onboard],
        );

        let other_owner = KeyPair::random_p256();
        assert_matches!(
            verify_chain(
                &chain,
                DelegateFunction::Onboard,
                Some(&other_owner.verifying_key()),
                None,
            ),
            Err(DelegateError::SignatureInvalid(_))
        );
    }

    #[test]
    fn expected_owner_identifier_is_scoped_by_root() {
        let owner_key = KeyPair::random_p256();
        let chain = generate(
            &[
                ChainLink {
                    common_name: "root",
                    identifier: Some("DNS:*.tenant1.example"),
                },
                ChainLink {
                    common_name: "server",
                    identifier: Some("DNS:srv.tenant1.example"),
                },
            ],
            &owner_key,
            &[DelegateFunction::Onboard],
        );

        verify_chain(
            &chain,
            DelegateFunction::Onboard,
            Some(&owner_key.verifying_key()),
            Some("DNS:a.tenant1.example"),
        )
        .unwrap();

        assert_matches!(
            verify_chain(
                &chain,
                DelegateFunction::Onboard,
                Some(&owner_key.verifying_key()),
                Some("DNS:a.tenant2.example"),
            ),
            Err(DelegateError::IdentifierNotPermitted { .. })
        );
    }

    #[test]
    fn empty_chain_is_rejected() {
        assert_matches!(
            verify_chain(&X5Chain::new(vec![]), DelegateFunction::Onboard, None, None),
            Err(DelegateError::EmptyChain)
        );
    }
}

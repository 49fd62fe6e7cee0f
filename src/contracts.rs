//! Bindings for the SSI contracts and a closed set of calls the benchmark issues.

use std::fmt;

use alloy_primitives::{Address, B256, Bytes, U256};
use alloy_sol_macro::sol;
use alloy_sol_types::SolCall;
use serde::Deserialize;

sol! {
    #[allow(missing_docs)]
    #[derive(Debug, PartialEq, Eq)]
    struct DidRecord {
        string did;
        bytes32 publicKey;
        string serviceEndpoint;
        uint8 role;
        bool active;
        address owner;
    }

    #[allow(missing_docs)]
    #[derive(Debug, PartialEq, Eq)]
    struct CredentialRecord {
        bytes32 id;
        string issuerDid;
        string holderDid;
        string credentialCid;
        uint8 status;
    }

    #[allow(missing_docs)]
    interface RoleControl {
        function getRole(address account) external view returns (uint8);
        function hasRole(uint8 role, address account) external view returns (bool);
        function getRoleCount(uint8 role) external view returns (uint256);
        function assignRole(uint8 role, address account) external;
        function revokeRole(uint8 role, address account) external;
    }

    #[allow(missing_docs)]
    interface DidRegistry {
        function createDid(string did, bytes32 publicKey, string serviceEndpoint, uint8 role) external;
        function updateDid(string did, bytes32 publicKey, string serviceEndpoint) external;
        function deactivateDid(string did) external;
        function resolveDid(string did) external view returns (DidRecord memory);
    }

    #[allow(missing_docs)]
    interface CredentialRegistry {
        function issueCredential(bytes32 id, string issuerDid, string holderDid, string credentialCid) external;
        function updateCredentialStatus(bytes32 id, uint8 status) external;
        function resolveCredential(bytes32 id) external view returns (CredentialRecord memory);
    }
}

/// Roles understood by RoleControl.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum Role {
    None = 0,
    Issuer = 1,
    Holder = 2,
    Trustee = 3,
}

impl Role {
    pub const GRANTABLE: [Role; 3] = [Role::Issuer, Role::Holder, Role::Trustee];

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::None),
            1 => Some(Self::Issuer),
            2 => Some(Self::Holder),
            3 => Some(Self::Trustee),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::None => "NONE",
            Self::Issuer => "ISSUER",
            Self::Holder => "HOLDER",
            Self::Trustee => "TRUSTEE",
        };
        f.write_str(name)
    }
}

/// Credential status codes stored by CredentialRegistry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CredentialStatus {
    None = 0,
    Active = 1,
    Revoked = 2,
    Suspended = 3,
}

impl CredentialStatus {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::None),
            1 => Some(Self::Active),
            2 => Some(Self::Revoked),
            3 => Some(Self::Suspended),
            _ => None,
        }
    }
}

/// The three deployed contracts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContractName {
    RoleControl,
    DidRegistry,
    CredentialRegistry,
}

impl ContractName {
    pub const ALL: [ContractName; 3] = [
        ContractName::RoleControl,
        ContractName::DidRegistry,
        ContractName::CredentialRegistry,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::RoleControl => "RoleControl",
            Self::DidRegistry => "DidRegistry",
            Self::CredentialRegistry => "CredentialRegistry",
        }
    }
}

impl fmt::Display for ContractName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Deployed addresses of the three contracts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct ContractAddresses {
    pub role_control: Address,
    pub did_registry: Address,
    pub credential_registry: Address,
}

impl ContractAddresses {
    pub fn address_of(&self, contract: ContractName) -> Address {
        match contract {
            ContractName::RoleControl => self.role_control,
            ContractName::DidRegistry => self.did_registry,
            ContractName::CredentialRegistry => self.credential_registry,
        }
    }

    pub fn contract_at(&self, address: Address) -> Option<ContractName> {
        ContractName::ALL
            .into_iter()
            .find(|contract| self.address_of(*contract) == address)
    }
}

/// A positional argument, kept around for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallArg {
    Address(Address),
    Uint(u64),
    Bytes32(B256),
    Str(String),
}

impl fmt::Display for CallArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Address(address) => write!(f, "{address}"),
            Self::Uint(value) => write!(f, "{value}"),
            Self::Bytes32(value) => write!(f, "{value}"),
            Self::Str(value) => write!(f, "{value:?}"),
        }
    }
}

/// One contract method invocation with its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContractCall {
    GetRole {
        account: Address,
    },
    HasRole {
        role: Role,
        account: Address,
    },
    GetRoleCount {
        role: Role,
    },
    AssignRole {
        role: Role,
        account: Address,
    },
    RevokeRole {
        role: Role,
        account: Address,
    },
    CreateDid {
        did: String,
        public_key: B256,
        service_endpoint: String,
        role: Role,
    },
    UpdateDid {
        did: String,
        public_key: B256,
        service_endpoint: String,
    },
    DeactivateDid {
        did: String,
    },
    ResolveDid {
        did: String,
    },
    IssueCredential {
        id: B256,
        issuer_did: String,
        holder_did: String,
        credential_cid: String,
    },
    UpdateCredentialStatus {
        id: B256,
        status: CredentialStatus,
    },
    ResolveCredential {
        id: B256,
    },
}

/// Decoded result of a read-only call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallOutput {
    Role(u8),
    Bool(bool),
    Count(U256),
    Did(DidRecord),
    Credential(CredentialRecord),
}

impl CallOutput {
    /// The role carried by a `getRole` result; unknown codes map to `None`.
    pub fn as_role(&self) -> Option<Role> {
        match self {
            Self::Role(raw) => Role::from_u8(*raw),
            _ => None,
        }
    }

    /// Saturating conversion of a `getRoleCount` result.
    pub fn as_count(&self) -> Option<u64> {
        match self {
            Self::Count(count) => Some(u64::try_from(*count).unwrap_or(u64::MAX)),
            _ => None,
        }
    }
}

impl ContractCall {
    pub fn contract(&self) -> ContractName {
        match self {
            Self::GetRole { .. }
            | Self::HasRole { .. }
            | Self::GetRoleCount { .. }
            | Self::AssignRole { .. }
            | Self::RevokeRole { .. } => ContractName::RoleControl,
            Self::CreateDid { .. }
            | Self::UpdateDid { .. }
            | Self::DeactivateDid { .. }
            | Self::ResolveDid { .. } => ContractName::DidRegistry,
            Self::IssueCredential { .. }
            | Self::UpdateCredentialStatus { .. }
            | Self::ResolveCredential { .. } => ContractName::CredentialRegistry,
        }
    }

    /// Solidity method name, also the key of the gas tables.
    pub fn method(&self) -> &'static str {
        match self {
            Self::GetRole { .. } => "getRole",
            Self::HasRole { .. } => "hasRole",
            Self::GetRoleCount { .. } => "getRoleCount",
            Self::AssignRole { .. } => "assignRole",
            Self::RevokeRole { .. } => "revokeRole",
            Self::CreateDid { .. } => "createDid",
            Self::UpdateDid { .. } => "updateDid",
            Self::DeactivateDid { .. } => "deactivateDid",
            Self::ResolveDid { .. } => "resolveDid",
            Self::IssueCredential { .. } => "issueCredential",
            Self::UpdateCredentialStatus { .. } => "updateCredentialStatus",
            Self::ResolveCredential { .. } => "resolveCredential",
        }
    }

    pub fn is_read_only(&self) -> bool {
        matches!(
            self,
            Self::GetRole { .. }
                | Self::HasRole { .. }
                | Self::GetRoleCount { .. }
                | Self::ResolveDid { .. }
                | Self::ResolveCredential { .. }
        )
    }

    /// Arguments in ABI order.
    pub fn args(&self) -> Vec<CallArg> {
        match self {
            Self::GetRole { account } => vec![CallArg::Address(*account)],
            Self::HasRole { role, account } | Self::AssignRole { role, account } | Self::RevokeRole { role, account } => {
                vec![CallArg::Uint(role.as_u8().into()), CallArg::Address(*account)]
            }
            Self::GetRoleCount { role } => vec![CallArg::Uint(role.as_u8().into())],
            Self::CreateDid {
                did,
                public_key,
                service_endpoint,
                role,
            } => vec![
                CallArg::Str(did.clone()),
                CallArg::Bytes32(*public_key),
                CallArg::Str(service_endpoint.clone()),
                CallArg::Uint(role.as_u8().into()),
            ],
            Self::UpdateDid {
                did,
                public_key,
                service_endpoint,
            } => vec![
                CallArg::Str(did.clone()),
                CallArg::Bytes32(*public_key),
                CallArg::Str(service_endpoint.clone()),
            ],
            Self::DeactivateDid { did } | Self::ResolveDid { did } => vec![CallArg::Str(did.clone())],
            Self::IssueCredential {
                id,
                issuer_did,
                holder_did,
                credential_cid,
            } => vec![
                CallArg::Bytes32(*id),
                CallArg::Str(issuer_did.clone()),
                CallArg::Str(holder_did.clone()),
                CallArg::Str(credential_cid.clone()),
            ],
            Self::UpdateCredentialStatus { id, status } => {
                vec![CallArg::Bytes32(*id), CallArg::Uint(status.as_u8().into())]
            }
            Self::ResolveCredential { id } => vec![CallArg::Bytes32(*id)],
        }
    }

    /// ABI-encode the call.
    pub fn calldata(&self) -> Bytes {
        let encoded = match self.clone() {
            Self::GetRole { account } => RoleControl::getRoleCall { account }.abi_encode(),
            Self::HasRole { role, account } => RoleControl::hasRoleCall {
                role: role.as_u8(),
                account,
            }
            .abi_encode(),
            Self::GetRoleCount { role } => RoleControl::getRoleCountCall { role: role.as_u8() }.abi_encode(),
            Self::AssignRole { role, account } => RoleControl::assignRoleCall {
                role: role.as_u8(),
                account,
            }
            .abi_encode(),
            Self::RevokeRole { role, account } => RoleControl::revokeRoleCall {
                role: role.as_u8(),
                account,
            }
            .abi_encode(),
            Self::CreateDid {
                did,
                public_key,
                service_endpoint,
                role,
            } => DidRegistry::createDidCall {
                did,
                publicKey: public_key,
                serviceEndpoint: service_endpoint,
                role: role.as_u8(),
            }
            .abi_encode(),
            Self::UpdateDid {
                did,
                public_key,
                service_endpoint,
            } => DidRegistry::updateDidCall {
                did,
                publicKey: public_key,
                serviceEndpoint: service_endpoint,
            }
            .abi_encode(),
            Self::DeactivateDid { did } => DidRegistry::deactivateDidCall { did }.abi_encode(),
            Self::ResolveDid { did } => DidRegistry::resolveDidCall { did }.abi_encode(),
            Self::IssueCredential {
                id,
                issuer_did,
                holder_did,
                credential_cid,
            } => CredentialRegistry::issueCredentialCall {
                id,
                issuerDid: issuer_did,
                holderDid: holder_did,
                credentialCid: credential_cid,
            }
            .abi_encode(),
            Self::UpdateCredentialStatus { id, status } => CredentialRegistry::updateCredentialStatusCall {
                id,
                status: status.as_u8(),
            }
            .abi_encode(),
            Self::ResolveCredential { id } => CredentialRegistry::resolveCredentialCall { id }.abi_encode(),
        };
        encoded.into()
    }

    /// Decode the return data of a read-only call. Write methods have no output.
    pub fn decode_output(&self, data: &[u8]) -> Result<Option<CallOutput>, alloy_sol_types::Error> {
        let output = match self {
            Self::GetRole { .. } => CallOutput::Role(RoleControl::getRoleCall::abi_decode_returns(data)?),
            Self::HasRole { .. } => CallOutput::Bool(RoleControl::hasRoleCall::abi_decode_returns(data)?),
            Self::GetRoleCount { .. } => {
                CallOutput::Count(RoleControl::getRoleCountCall::abi_decode_returns(data)?)
            }
            Self::ResolveDid { .. } => CallOutput::Did(DidRegistry::resolveDidCall::abi_decode_returns(data)?),
            Self::ResolveCredential { .. } => {
                CallOutput::Credential(CredentialRegistry::resolveCredentialCall::abi_decode_returns(data)?)
            }
            _ => return Ok(None),
        };
        Ok(Some(output))
    }
}

impl fmt::Display for ContractCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let args = self
            .args()
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        write!(f, "{}.{}({})", self.contract(), self.method(), args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_sol_types::SolValue;

    #[test]
    fn read_only_methods() {
        let account = Address::repeat_byte(0x11);
        assert!(ContractCall::GetRole { account }.is_read_only());
        assert!(ContractCall::ResolveDid { did: "did:ssi:w1-1".into() }.is_read_only());
        assert!(
            !ContractCall::AssignRole {
                role: Role::Issuer,
                account
            }
            .is_read_only()
        );
    }

    #[test]
    fn calldata_starts_with_selector() {
        let call = ContractCall::AssignRole {
            role: Role::Trustee,
            account: Address::repeat_byte(0x22),
        };
        let data = call.calldata();
        assert_eq!(&data[..4], RoleControl::assignRoleCall::SELECTOR.as_slice());
        assert_eq!(data.len(), 4 + 64);
    }

    #[test]
    fn decodes_role_and_record_outputs() {
        let role_call = ContractCall::GetRole {
            account: Address::ZERO,
        };
        let encoded = <alloy_sol_types::sol_data::Uint<8> as alloy_sol_types::SolType>::abi_encode(&3u8);
        let output = role_call.decode_output(&encoded).unwrap().unwrap();
        assert_eq!(output.as_role(), Some(Role::Trustee));

        let record = DidRecord {
            did: "did:ssi:w1-1".into(),
            publicKey: B256::repeat_byte(7),
            serviceEndpoint: "https://w1.example/1".into(),
            role: Role::Issuer.as_u8(),
            active: true,
            owner: Address::repeat_byte(1),
        };
        let resolve = ContractCall::ResolveDid {
            did: record.did.clone(),
        };
        let output = resolve.decode_output(&record.abi_encode()).unwrap().unwrap();
        assert_eq!(output, CallOutput::Did(record));
    }

    #[test]
    fn display_lists_arguments_in_order() {
        let call = ContractCall::UpdateCredentialStatus {
            id: B256::ZERO,
            status: CredentialStatus::Revoked,
        };
        let rendered = call.to_string();
        assert!(rendered.starts_with("CredentialRegistry.updateCredentialStatus("));
        assert!(rendered.ends_with(", 2)"));
    }

    #[test]
    fn role_codes_round_trip() {
        for role in [Role::None, Role::Issuer, Role::Holder, Role::Trustee] {
            assert_eq!(Role::from_u8(role.as_u8()), Some(role));
        }
        assert_eq!(Role::from_u8(9), None);
    }
}

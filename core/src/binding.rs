//! Callable bindings over the deployed escrow contract.

use std::fmt;
use std::sync::Arc;

use alloy::dyn_abi::{DynSolType, DynSolValue, FunctionExt, JsonAbiExt, Specifier};
use alloy::json_abi::{Function, JsonAbi, StateMutability};
use alloy::primitives::{Address, Bytes, U256};

use escrow_transport::{BlockRef, CallRequest, Session, WriteRequest};

use crate::errors::EscrowError;

/// Produces bindings for one contract interface.
#[derive(Debug, Clone)]
pub struct ContractBindingFactory {
    interface: Arc<JsonAbi>,
}

impl ContractBindingFactory {
    #[must_use]
    pub fn new(interface: JsonAbi) -> Self {
        Self {
            interface: Arc::new(interface),
        }
    }

    #[must_use]
    /// Bind `session` to the contract at `address`, after confirming code exists there.
    pub async fn bind(
        &self,
        session: Arc<dyn Session>,
        address: Address,
    ) -> Result<ContractBinding, EscrowError> {
        let code = session
            .code_at(address)
            .await
            .map_err(|source| EscrowError::from_transport("eth_getCode", source))?;
        if code.is_empty() {
            return Err(EscrowError::ContractNotDeployed { address });
        }
        tracing::debug!(
            %address,
            account = %session.account(),
            code_len = code.len(),
            "Contract bound"
        );
        Ok(ContractBinding {
            session,
            interface: Arc::clone(&self.interface),
            address,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallClass {
    Read,
    Write,
}

/// One session bound to one contract address.
#[derive(Clone)]
pub struct ContractBinding {
    session: Arc<dyn Session>,
    interface: Arc<JsonAbi>,
    address: Address,
}

impl fmt::Debug for ContractBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContractBinding")
            .field("address", &self.address)
            .field("account", &self.session.account())
            .finish_non_exhaustive()
    }
}

impl ContractBinding {
    #[must_use]
    pub fn address(&self) -> Address {
        self.address
    }

    /// Account the binding signs as.
    #[must_use]
    pub fn account(&self) -> Address {
        self.session.account()
    }

    pub(crate) fn session(&self) -> &Arc<dyn Session> {
        &self.session
    }

    /// View/pure call. Returns the decoded outputs.
    pub async fn read(
        &self,
        call: &str,
        args: &[DynSolValue],
        block: BlockRef,
    ) -> Result<Vec<DynSolValue>, EscrowError> {
        let function = self.function(call, args.len(), CallClass::Read)?;
        let input = encode(function, call, args)?;
        let output = self
            .session
            .call(
                CallRequest {
                    to: self.address,
                    input,
                },
                block,
            )
            .await
            .map_err(|source| EscrowError::from_transport(call, source))?;
        function
            .abi_decode_output(&output, true)
            .map_err(|e| EscrowError::invalid_call(call, format!("undecodable output: {e}")))
    }

    /// Build the transaction for a state-changing call. Nothing is sent.
    pub fn encode_write(
        &self,
        call: &str,
        args: &[DynSolValue],
        value: U256,
    ) -> Result<WriteRequest, EscrowError> {
        let function = self.function(call, args.len(), CallClass::Write)?;
        if !value.is_zero() && function.state_mutability != StateMutability::Payable {
            return Err(EscrowError::invalid_call(
                call,
                "value attached to a non-payable function",
            ));
        }
        Ok(WriteRequest {
            to: self.address,
            input: encode(function, call, args)?,
            value,
        })
    }

    fn function(&self, call: &str, arity: usize, class: CallClass) -> Result<&Function, EscrowError> {
        let overloads = self
            .interface
            .function(call)
            .ok_or_else(|| EscrowError::invalid_call(call, "not in contract interface"))?;
        let function = overloads
            .iter()
            .find(|f| f.inputs.len() == arity)
            .ok_or_else(|| {
                EscrowError::invalid_call(call, format!("no overload takes {arity} argument(s)"))
            })?;

        let actual = match function.state_mutability {
            StateMutability::Pure | StateMutability::View => CallClass::Read,
            StateMutability::NonPayable | StateMutability::Payable => CallClass::Write,
        };
        if actual != class {
            let reason = match class {
                CallClass::Read => "state-changing function used as a read",
                CallClass::Write => "read-only function used as a write",
            };
            return Err(EscrowError::invalid_call(call, reason));
        }
        Ok(function)
    }
}

/// ABI-encode `args` for `function`, widening integer literals to the declared width.
fn encode(function: &Function, call: &str, args: &[DynSolValue]) -> Result<Bytes, EscrowError> {
    let mut fitted = Vec::with_capacity(args.len());
    for (param, arg) in function.inputs.iter().zip(args) {
        let ty = param
            .resolve()
            .map_err(|e| EscrowError::invalid_call(call, format!("parameter {}: {e}", param.name)))?;
        fitted.push(fit_integer(&ty, arg).map_err(|reason| {
            EscrowError::invalid_call(call, format!("parameter {}: {reason}", param.name))
        })?);
    }
    let encoded = function
        .abi_encode_input(&fitted)
        .map_err(|e| EscrowError::invalid_call(call, e.to_string()))?;
    Ok(Bytes::from(encoded))
}

fn fit_integer(ty: &DynSolType, arg: &DynSolValue) -> Result<DynSolValue, String> {
    match (ty, arg) {
        (DynSolType::Uint(bits), DynSolValue::Uint(value, _)) => {
            if value.bit_len() > *bits {
                return Err(format!("{value} does not fit in uint{bits}"));
            }
            Ok(DynSolValue::Uint(*value, *bits))
        }
        _ => Ok(arg.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{SimulatedChain, escrow_interface, identity};
    use escrow_types::Role;

    async fn bound(chain: &SimulatedChain) -> ContractBinding {
        let transport = chain.transport();
        let session = transport
            .open_session(identity("buyer", Role::Buyer).credential())
            .await
            .unwrap();
        ContractBindingFactory::new(escrow_interface())
            .bind(session, chain.contract())
            .await
            .unwrap()
    }

    fn id_arg() -> DynSolValue {
        DynSolValue::String("escrow-1".to_string())
    }

    #[tokio::test]
    async fn bind_requires_deployed_code() {
        let chain = SimulatedChain::new();
        let session = chain
            .transport()
            .open_session(identity("buyer", Role::Buyer).credential())
            .await
            .unwrap();
        let empty = Address::repeat_byte(0xee);
        let err = ContractBindingFactory::new(escrow_interface())
            .bind(session, empty)
            .await
            .unwrap_err();
        assert!(matches!(err, EscrowError::ContractNotDeployed { address } if address == empty));
    }

    #[tokio::test]
    async fn write_calls_encode_selector_and_args() {
        let chain = SimulatedChain::new();
        let binding = bound(&chain).await;
        let request = binding
            .encode_write("confirmFulfillment", &[id_arg()], U256::ZERO)
            .unwrap();
        assert_eq!(request.to, chain.contract());
        let abi = escrow_interface();
        let function = &abi.function("confirmFulfillment").unwrap()[0];
        assert_eq!(&request.input[..4], function.selector().as_slice());
    }

    #[tokio::test]
    async fn call_classes_are_enforced() {
        let chain = SimulatedChain::new();
        let binding = bound(&chain).await;

        let err = binding
            .encode_write("escrowStatus", &[id_arg()], U256::ZERO)
            .unwrap_err();
        assert!(matches!(err, EscrowError::InvalidCall { .. }));

        let err = binding
            .read("confirmFulfillment", &[id_arg()], BlockRef::Latest)
            .await
            .unwrap_err();
        assert!(matches!(err, EscrowError::InvalidCall { .. }));
    }

    #[tokio::test]
    async fn unknown_functions_and_bad_args_rejected() {
        let chain = SimulatedChain::new();
        let binding = bound(&chain).await;

        assert!(matches!(
            binding.encode_write("selfDestruct", &[], U256::ZERO),
            Err(EscrowError::InvalidCall { .. })
        ));
        assert!(matches!(
            binding.encode_write("confirmFulfillment", &[], U256::ZERO),
            Err(EscrowError::InvalidCall { .. })
        ));
        assert!(matches!(
            binding.encode_write(
                "confirmFulfillment",
                &[DynSolValue::Bool(true)],
                U256::ZERO
            ),
            Err(EscrowError::InvalidCall { .. })
        ));
    }

    #[tokio::test]
    async fn value_only_on_payable() {
        let chain = SimulatedChain::new();
        let binding = bound(&chain).await;
        let err = binding
            .encode_write("confirmFulfillment", &[id_arg()], U256::from(1u64))
            .unwrap_err();
        assert!(err.to_string().contains("non-payable"));
    }

    #[test]
    fn integers_fit_declared_width() {
        let narrowed = fit_integer(&DynSolType::Uint(8), &DynSolValue::Uint(U256::from(3u64), 256))
            .unwrap();
        assert_eq!(narrowed, DynSolValue::Uint(U256::from(3u64), 8));
        assert!(fit_integer(&DynSolType::Uint(8), &DynSolValue::Uint(U256::from(256u64), 256)).is_err());
    }
}

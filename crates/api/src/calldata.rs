//! Calldata from a JSON ABI, a function name and JSON arguments.

use alloy::{
    dyn_abi::{DynSolType, DynSolValue, JsonAbiExt, Specifier},
    json_abi::JsonAbi,
};
use alloy_primitives::Bytes;
use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum CalldataError {
    #[error("invalid abi: {0}")]
    InvalidAbi(String),
    #[error("function `{0}` not found in abi")]
    UnknownFunction(String),
    #[error("function `{name}` has no overload taking {count} arguments")]
    ArgumentCount { name: String, count: usize },
    #[error("argument {index}: {message}")]
    Argument { index: usize, message: String },
}

/// Encodes a call to `function_name` with `args`.
///
/// `abi` is either the ABI array or a string holding it. Overloads are told
/// apart by argument count.
pub fn encode_call(
    abi: &Value,
    function_name: &str,
    args: &[Value],
) -> Result<Bytes, CalldataError> {
    let abi: JsonAbi = match abi {
        Value::String(raw) => serde_json::from_str(raw),
        other => serde_json::from_value(other.clone()),
    }
    .map_err(|err| CalldataError::InvalidAbi(err.to_string()))?;

    let overloads = abi
        .function(function_name)
        .ok_or_else(|| CalldataError::UnknownFunction(function_name.to_owned()))?;
    let function = overloads
        .iter()
        .find(|function| function.inputs.len() == args.len())
        .ok_or_else(|| CalldataError::ArgumentCount {
            name: function_name.to_owned(),
            count: args.len(),
        })?;

    let values = function
        .inputs
        .iter()
        .zip(args)
        .enumerate()
        .map(|(index, (param, arg))| {
            let ty = param.resolve().map_err(|err| CalldataError::Argument {
                index,
                message: err.to_string(),
            })?;
            to_sol_value(&ty, arg).map_err(|message| CalldataError::Argument { index, message })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let encoded = function
        .abi_encode_input(&values)
        .map_err(|err| CalldataError::InvalidAbi(err.to_string()))?;
    Ok(encoded.into())
}

fn to_sol_value(ty: &DynSolType, arg: &Value) -> Result<DynSolValue, String> {
    match (ty, arg) {
        (DynSolType::Array(inner), Value::Array(items)) => items
            .iter()
            .map(|item| to_sol_value(inner, item))
            .collect::<Result<_, _>>()
            .map(DynSolValue::Array),
        (DynSolType::FixedArray(inner, len), Value::Array(items)) => {
            if items.len() != *len {
                return Err(format!("expected {len} elements for {ty}, got {}", items.len()));
            }
            items
                .iter()
                .map(|item| to_sol_value(inner, item))
                .collect::<Result<_, _>>()
                .map(DynSolValue::FixedArray)
        }
        (DynSolType::Tuple(types), Value::Array(items)) => {
            if items.len() != types.len() {
                return Err(format!(
                    "expected {} fields for {ty}, got {}",
                    types.len(),
                    items.len()
                ));
            }
            types
                .iter()
                .zip(items)
                .map(|(ty, item)| to_sol_value(ty, item))
                .collect::<Result<_, _>>()
                .map(DynSolValue::Tuple)
        }
        (_, Value::String(raw)) => ty.coerce_str(raw).map_err(|err| err.to_string()),
        (_, Value::Number(number)) => ty
            .coerce_str(&number.to_string())
            .map_err(|err| err.to_string()),
        (_, Value::Bool(flag)) => ty
            .coerce_str(if *flag { "true" } else { "false" })
            .map_err(|err| err.to_string()),
        _ => Err(format!("cannot encode {arg} as {ty}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn erc20_abi() -> Value {
        json!([
            {
                "type": "function",
                "name": "transfer",
                "stateMutability": "nonpayable",
                "inputs": [
                    {"name": "to", "type": "address"},
                    {"name": "amount", "type": "uint256"}
                ],
                "outputs": [{"name": "", "type": "bool"}]
            },
            {
                "type": "function",
                "name": "batch",
                "stateMutability": "nonpayable",
                "inputs": [
                    {"name": "recipients", "type": "address[]"},
                    {
                        "name": "order",
                        "type": "tuple",
                        "components": [
                            {"name": "id", "type": "uint64"},
                            {"name": "urgent", "type": "bool"}
                        ]
                    }
                ],
                "outputs": []
            }
        ])
    }

    #[test]
    fn encodes_erc20_transfer() -> eyre::Result<()> {
        let to = "0x1111111111111111111111111111111111111111";
        let calldata = encode_call(&erc20_abi(), "transfer", &[json!(to), json!("1000")])?;

        assert_eq!(&calldata[..4], &[0xa9, 0x05, 0x9c, 0xbb]);
        assert_eq!(calldata.len(), 4 + 32 * 2);
        assert_eq!(&calldata[16..36], &[0x11; 20]);
        assert_eq!(calldata[67], 0xe8);
        assert_eq!(calldata[66], 0x03);
        Ok(())
    }

    #[test]
    fn numbers_and_abi_strings_are_accepted() -> eyre::Result<()> {
        let abi = erc20_abi().to_string();
        let from_string = encode_call(
            &Value::String(abi),
            "transfer",
            &[json!("0x1111111111111111111111111111111111111111"), json!(1000)],
        )?;
        let from_value = encode_call(
            &erc20_abi(),
            "transfer",
            &[json!("0x1111111111111111111111111111111111111111"), json!("1000")],
        )?;
        assert_eq!(from_string, from_value);
        Ok(())
    }

    #[test]
    fn encodes_arrays_and_tuples() -> eyre::Result<()> {
        let calldata = encode_call(
            &erc20_abi(),
            "batch",
            &[
                json!([
                    "0x1111111111111111111111111111111111111111",
                    "0x2222222222222222222222222222222222222222"
                ]),
                json!([7, true]),
            ],
        )?;
        // head (offset, id, urgent) + array length + two addresses
        assert_eq!(calldata.len(), 4 + 32 * 6);
        Ok(())
    }

    #[test]
    fn rejects_bad_input() {
        let abi = erc20_abi();
        assert!(matches!(
            encode_call(&abi, "approve", &[]),
            Err(CalldataError::UnknownFunction(_))
        ));
        assert!(matches!(
            encode_call(&abi, "transfer", &[json!("0x11")]),
            Err(CalldataError::ArgumentCount { count: 1, .. })
        ));
        assert!(matches!(
            encode_call(&abi, "transfer", &[json!("not an address"), json!("1")]),
            Err(CalldataError::Argument { index: 0, .. })
        ));
        assert!(matches!(
            encode_call(&json!({"not": "an abi"}), "transfer", &[]),
            Err(CalldataError::InvalidAbi(_))
        ));
    }
}

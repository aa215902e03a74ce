//! Feed-forward stage and activation functions.
//!
//! # Formula
//!
//! `FFN(x) = layernorm(act(x @ W_i + b_i) @ W_o + b_o + x)`
//!
//! The activation is parsed from the config's `hidden_act` once, at load time.
//! Any name containing `gelu` selects the exact erf form, except `gelu_fast`
//! and `gelu_pytorch_tanh`, which select the tanh approximation.

use super::{AddLayerNorm, BertConfig, FastLayerNorm, WeightScope};
use crate::error::{FlashBertError, Result};
use candle_core::Tensor;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Supported feed-forward activations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    /// Exact GELU, `x * Phi(x)`.
    Gelu,
    /// Tanh-approximated GELU.
    GeluTanh,
    /// `max(0, x)`
    Relu,
    /// `min(max(0, x), 6)`
    Relu6,
    /// `max(0, x)^2`
    Relu2,
    /// `x * sigmoid(x)`
    Silu,
    /// Hyperbolic tangent.
    Tanh,
    /// Logistic sigmoid.
    Sigmoid,
    /// `x * tanh(softplus(x))`
    Mish,
    /// `max(x, 0.01 * x)`
    LeakyRelu,
    /// Identity.
    Linear,
}

type ActivationFn = fn(&Tensor) -> candle_core::Result<Tensor>;

impl Activation {
    /// Bound function for this activation.
    pub fn function(&self) -> ActivationFn {
        match self {
            Activation::Gelu => |x| x.gelu_erf(),
            Activation::GeluTanh => |x| x.gelu(),
            Activation::Relu => |x| x.relu(),
            Activation::Relu6 => |x| x.relu()?.minimum(6f64),
            Activation::Relu2 => |x| x.relu()?.sqr(),
            Activation::Silu => candle_nn::ops::silu,
            Activation::Tanh => |x| x.tanh(),
            Activation::Sigmoid => candle_nn::ops::sigmoid,
            Activation::Mish => |x| {
                let softplus = (x.exp()? + 1.0)?.log()?;
                x.mul(&softplus.tanh()?)
            },
            Activation::LeakyRelu => |x| x.maximum(&(x * 0.01)?),
            Activation::Linear => |x| Ok(x.clone()),
        }
    }

    /// Apply to a tensor.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        Ok((self.function())(x)?)
    }
}

impl FromStr for Activation {
    type Err = FlashBertError;

    fn from_str(name: &str) -> Result<Self> {
        if name.contains("gelu") {
            return Ok(match name {
                "gelu_fast" | "gelu_pytorch_tanh" => Activation::GeluTanh,
                _ => Activation::Gelu,
            });
        }
        match name {
            "relu" => Ok(Activation::Relu),
            "relu6" => Ok(Activation::Relu6),
            "relu2" => Ok(Activation::Relu2),
            "silu" | "swish" => Ok(Activation::Silu),
            "tanh" => Ok(Activation::Tanh),
            "sigmoid" => Ok(Activation::Sigmoid),
            "mish" => Ok(Activation::Mish),
            "leaky_relu" => Ok(Activation::LeakyRelu),
            "linear" => Ok(Activation::Linear),
            other => Err(FlashBertError::UnsupportedActivation(other.to_string())),
        }
    }
}

impl fmt::Display for Activation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Activation::Gelu => "gelu",
            Activation::GeluTanh => "gelu_pytorch_tanh",
            Activation::Relu => "relu",
            Activation::Relu6 => "relu6",
            Activation::Relu2 => "relu2",
            Activation::Silu => "silu",
            Activation::Tanh => "tanh",
            Activation::Sigmoid => "sigmoid",
            Activation::Mish => "mish",
            Activation::LeakyRelu => "leaky_relu",
            Activation::Linear => "linear",
        };
        f.write_str(name)
    }
}

/// Two-layer MLP with residual add + layer norm.
#[derive(Debug, Clone)]
pub struct BertFeedForward {
    /// `[hidden, intermediate]`
    intermediate_weight: Tensor,
    /// `[intermediate]`
    intermediate_bias: Tensor,
    /// `[intermediate, hidden]`
    output_weight: Tensor,
    /// `[hidden]`
    output_bias: Tensor,
    activation: Activation,
    act: ActivationFn,
    layer_norm: FastLayerNorm,
}

impl BertFeedForward {
    /// Load from an `encoder.layer.{i}` scope.
    pub fn load(vb: &WeightScope<'_>, config: &BertConfig, kernel: Arc<dyn AddLayerNorm>) -> Result<Self> {
        let activation: Activation = config.hidden_act.parse()?;

        let intermediate = vb.pp("intermediate.dense");
        let output = vb.pp("output");
        let intermediate_weight = intermediate.get_transposed("weight")?;
        let output_weight = output.pp("dense").get_transposed("weight")?;
        let expected = [config.hidden_size, config.intermediate_size];
        if intermediate_weight.dims() != expected {
            return Err(FlashBertError::ShapeMismatch(format!(
                "intermediate weight is {:?} after transpose, expected {:?}",
                intermediate_weight.dims(),
                expected
            )));
        }

        Ok(Self {
            intermediate_weight,
            intermediate_bias: intermediate.get("bias")?,
            output_weight,
            output_bias: output.pp("dense").get("bias")?,
            activation,
            act: activation.function(),
            layer_norm: FastLayerNorm::new(
                output.get("LayerNorm.weight")?,
                output.get("LayerNorm.bias")?,
                config.layer_norm_eps,
                kernel,
            )?,
        })
    }

    /// Forward pass over `[tokens, hidden]`.
    pub fn forward(&self, hidden: &Tensor) -> Result<Tensor> {
        let x = hidden
            .matmul(&self.intermediate_weight)?
            .broadcast_add(&self.intermediate_bias)?;
        let x = (self.act)(&x)?;
        let x = x.matmul(&self.output_weight)?.broadcast_add(&self.output_bias)?;
        let (out, _) = self.layer_norm.forward(&x, Some(hidden))?;
        Ok(out)
    }

    /// Configured activation.
    pub fn activation(&self) -> Activation {
        self.activation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use std::collections::HashMap;

    fn apply(act: Activation, values: &[f32]) -> Vec<f32> {
        let x = Tensor::new(values, &Device::Cpu).unwrap();
        act.forward(&x).unwrap().to_vec1().unwrap()
    }

    fn close(a: &[f32], b: &[f32], tol: f32) {
        for (x, y) in a.iter().zip(b.iter()) {
            assert!((x - y).abs() < tol, "{} vs {}", x, y);
        }
    }

    #[test]
    fn gelu_substring_rule() {
        assert_eq!("gelu".parse::<Activation>().unwrap(), Activation::Gelu);
        assert_eq!("gelu_new".parse::<Activation>().unwrap(), Activation::Gelu);
        assert_eq!("gelu_fast".parse::<Activation>().unwrap(), Activation::GeluTanh);
        assert_eq!(
            "gelu_pytorch_tanh".parse::<Activation>().unwrap(),
            Activation::GeluTanh
        );
        assert_eq!("swish".parse::<Activation>().unwrap(), Activation::Silu);
        assert!(matches!(
            "softsign".parse::<Activation>(),
            Err(FlashBertError::UnsupportedActivation(_))
        ));
    }

    #[test]
    fn gelu_variants_differ() {
        let xs = [-2.0f32, -0.5, 0.0, 1.0, 3.0];
        // 0.5 * x * (1 + erf(x / sqrt(2)))
        close(
            &apply(Activation::Gelu, &xs),
            &[-0.045_500_26, -0.154_268_5, 0.0, 0.841_344_7, 2.995_950_2],
            1e-4,
        );
        // 0.5 * x * (1 + tanh(sqrt(2/pi) * (x + 0.044715 x^3)))
        close(
            &apply(Activation::GeluTanh, &xs),
            &[-0.045_402_3, -0.154_286, 0.0, 0.841_192, 2.996_363_5],
            1e-4,
        );
    }

    #[test]
    fn elementwise_activations() {
        let xs = [-1.0f32, 0.5, 8.0];
        close(&apply(Activation::Relu, &xs), &[0.0, 0.5, 8.0], 1e-6);
        close(&apply(Activation::Relu6, &xs), &[0.0, 0.5, 6.0], 1e-6);
        close(&apply(Activation::Relu2, &xs), &[0.0, 0.25, 64.0], 1e-5);
        assert_eq!(apply(Activation::Linear, &xs), xs);
        close(&apply(Activation::LeakyRelu, &xs), &[-0.01, 0.5, 8.0], 1e-6);
        close(
            &apply(Activation::Sigmoid, &[0.0]),
            &[0.5],
            1e-6,
        );
        // silu(1) = 1 / (1 + e^-1)
        close(&apply(Activation::Silu, &[1.0]), &[0.731_058_6], 1e-5);
        // mish(1) = tanh(ln(1 + e))
        close(&apply(Activation::Mish, &[1.0]), &[0.865_098_4], 1e-5);
        close(&apply(Activation::Tanh, &[0.5]), &[0.462_117_2], 1e-5);
    }

    #[test]
    fn display_roundtrips_through_parse() {
        for act in [
            Activation::Gelu,
            Activation::GeluTanh,
            Activation::Relu,
            Activation::Silu,
            Activation::Mish,
        ] {
            assert_eq!(act.to_string().parse::<Activation>().unwrap(), act);
        }
    }

    #[test]
    fn feed_forward_with_zero_weights_normalizes_bias_plus_input() {
        let device = Device::Cpu;
        let mut t = HashMap::new();
        let z = |s: &[usize]| Tensor::zeros(s, DType::F32, &device).unwrap();
        t.insert("intermediate.dense.weight".to_string(), z(&[3, 2]));
        t.insert("intermediate.dense.bias".to_string(), z(&[3]));
        t.insert("output.dense.weight".to_string(), z(&[2, 3]));
        t.insert(
            "output.dense.bias".to_string(),
            Tensor::new(&[1f32, -1.], &device).unwrap(),
        );
        t.insert("output.LayerNorm.weight".to_string(), Tensor::ones(2, DType::F32, &device).unwrap());
        t.insert("output.LayerNorm.bias".to_string(), z(&[2]));

        let config = BertConfig {
            hidden_size: 2,
            intermediate_size: 3,
            hidden_act: "relu".into(),
            ..Default::default()
        };
        let vb = WeightScope::new(&t, DType::F32, &device);
        let ffn = BertFeedForward::load(&vb, &config, Arc::new(crate::model::GenericAddLayerNorm)).unwrap();
        assert_eq!(ffn.activation(), Activation::Relu);

        // input [3, 3] + bias [1, -1] = [4, 2] -> [1, -1]
        let x = Tensor::new(&[[3f32, 3.]], &device).unwrap();
        let out = ffn.forward(&x).unwrap().to_vec2::<f32>().unwrap();
        close(&out[0], &[1.0, -1.0], 1e-4);
    }

    #[test]
    fn unknown_activation_fails_construction() {
        let config = BertConfig {
            hidden_act: "softsign".into(),
            ..Default::default()
        };
        let t: HashMap<String, Tensor> = HashMap::new();
        let vb = WeightScope::new(&t, DType::F32, &Device::Cpu);
        let err = BertFeedForward::load(&vb, &config, Arc::new(crate::model::GenericAddLayerNorm))
            .unwrap_err();
        assert!(matches!(err, FlashBertError::UnsupportedActivation(_)));
    }
}

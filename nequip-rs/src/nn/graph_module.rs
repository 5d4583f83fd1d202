//! The module interface shared by everything that transforms an
//! [`AtomicDataDict`].

use crate::data::{AtomicDataDict, POSITIONS_KEY};
use crate::error::{NequipError, NequipResult};
use crate::irreps::{Irreps, IrrepsDict};

/// A model stage that reads and writes fields of an [`AtomicDataDict`].
///
/// `irreps_in` declares the fields the module consumes and `irreps_out`
/// every field present after `forward`, inputs included.
pub trait GraphModule {
    /// Irreps of the fields this module reads.
    fn irreps_in(&self) -> &IrrepsDict;

    /// Irreps of the fields available after `forward`.
    fn irreps_out(&self) -> &IrrepsDict;

    /// Run the module, writing outputs into `data`.
    fn forward(&self, data: &mut AtomicDataDict) -> NequipResult<()>;

    /// Whether the module is in training mode.
    fn training(&self) -> bool {
        false
    }

    /// Switch between training and evaluation mode.
    fn set_training(&mut self, _training: bool) {}
}

impl<M: GraphModule + ?Sized> GraphModule for Box<M> {
    fn irreps_in(&self) -> &IrrepsDict {
        (**self).irreps_in()
    }

    fn irreps_out(&self) -> &IrrepsDict {
        (**self).irreps_out()
    }

    fn forward(&self, data: &mut AtomicDataDict) -> NequipResult<()> {
        (**self).forward(data)
    }

    fn training(&self) -> bool {
        (**self).training()
    }

    fn set_training(&mut self, training: bool) {
        (**self).set_training(training);
    }
}

/// Fill in irreps every graph carries implicitly. Positions are always a
/// polar vector.
pub fn fix_irreps_dict(mut irreps: IrrepsDict) -> IrrepsDict {
    irreps
        .entry(POSITIONS_KEY.to_string())
        .or_insert_with(|| Some(Irreps::vector()));
    irreps
}

/// Resolve a module's input and output irreps.
///
/// `irreps_in` is what the surrounding model provides; `my_irreps_in` is
/// what this module insists on for particular fields, and `required` names
/// fields that must be present with any type. Output irreps start as the
/// input irreps and are overridden by `irreps_out`.
///
/// # Errors
///
/// Returns [`NequipError::InvalidConfiguration`] if a provided field
/// disagrees with `my_irreps_in` or a required field is missing.
pub fn init_irreps(
    irreps_in: &IrrepsDict,
    my_irreps_in: &IrrepsDict,
    required: &[&str],
    irreps_out: &IrrepsDict,
) -> NequipResult<(IrrepsDict, IrrepsDict)> {
    let mut resolved_in = fix_irreps_dict(irreps_in.clone());

    for (field, mine) in my_irreps_in {
        if let Some(given) = resolved_in.get(field) {
            if given != mine {
                return Err(NequipError::invalid_config(format!(
                    "input irreps {} for field '{field}' are incompatible, expected {}",
                    describe(given),
                    describe(mine)
                )));
            }
        }
    }
    resolved_in.extend(my_irreps_in.iter().map(|(k, v)| (k.clone(), v.clone())));

    if let Some(missing) = required.iter().find(|f| !resolved_in.contains_key(**f)) {
        return Err(NequipError::invalid_config(format!(
            "required input field '{missing}' is not provided"
        )));
    }

    let mut resolved_out = resolved_in.clone();
    resolved_out.extend(irreps_out.iter().map(|(k, v)| (k.clone(), v.clone())));
    Ok((resolved_in, resolved_out))
}

fn describe(irreps: &Option<Irreps>) -> String {
    irreps
        .as_ref()
        .map_or_else(|| "None".to_string(), ToString::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::irreps::irreps_dict;

    #[test]
    fn test_positions_default_to_vector() {
        let fixed = fix_irreps_dict(IrrepsDict::new());
        assert_eq!(fixed[POSITIONS_KEY], Some(Irreps::vector()));
    }

    #[test]
    fn test_outputs_extend_inputs() {
        let given = irreps_dict([("node_features", Some("8x0e"))]).unwrap();
        let out = irreps_dict([("total_energy", Some("0e"))]).unwrap();
        let (irreps_in, irreps_out) = init_irreps(&given, &IrrepsDict::new(), &[], &out).unwrap();
        assert!(irreps_in.contains_key(POSITIONS_KEY));
        assert!(irreps_out.contains_key("node_features"));
        assert_eq!(irreps_out["total_energy"], Some(Irreps::scalar()));
    }

    #[test]
    fn test_incompatible_input() {
        let given = irreps_dict([("total_energy", Some("1o"))]).unwrap();
        let mine = irreps_dict([("total_energy", Some("0e"))]).unwrap();
        let err = init_irreps(&given, &mine, &[], &IrrepsDict::new()).unwrap_err();
        assert!(matches!(err, NequipError::InvalidConfiguration(_)));
    }

    #[test]
    fn test_required_field() {
        let err = init_irreps(
            &IrrepsDict::new(),
            &IrrepsDict::new(),
            &["edge_index"],
            &IrrepsDict::new(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("edge_index"));
    }
}

use mqx_common::AttributeSet;

/// Converts between a backend's native header representation and
/// [`AttributeSet`].
///
/// Both directions are total: entries that are absent, not text, or
/// otherwise unusable are dropped rather than reported. Mapping an attribute
/// set to native headers and back keeps every key/value pair, though
/// ordering and type metadata are up to the backend.
pub trait AttributeMapper {
    type Native;

    fn to_attributes(native: &Self::Native) -> AttributeSet;

    fn to_native(attributes: &AttributeSet) -> Self::Native;
}

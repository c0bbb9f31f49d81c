use glam::{Mat3, Mat4, Quat, Vec3};

/// The translation, rotation, and scale of a node, decomposed from its
/// column-major transform matrix.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Trs {
    pub translation: Vec3,
    pub rotation: Quat,
    pub scale: Vec3,
}

impl Trs {
    /// Decomposes a column-major transform matrix. The scale of each axis is
    /// the length of the corresponding basis column, and the rotation is read
    /// from the basis with those lengths divided out. A zero-length axis is
    /// treated as unit scale so degenerate matrices don't produce NaN values.
    pub fn from_mat4(matrix: &Mat4) -> Self {
        let translation = matrix.w_axis.truncate();
        let scale = Vec3::new(
            guard(matrix.x_axis.truncate().length()),
            guard(matrix.y_axis.truncate().length()),
            guard(matrix.z_axis.truncate().length()),
        );
        let basis = Mat3::from_cols(
            matrix.x_axis.truncate() / scale.x,
            matrix.y_axis.truncate() / scale.y,
            matrix.z_axis.truncate() / scale.z,
        );

        Self {
            translation,
            rotation: Quat::from_mat3(&basis).normalize(),
            scale,
        }
    }

    pub fn to_mat4(&self) -> Mat4 {
        Mat4::from_scale_rotation_translation(self.scale, self.rotation, self.translation)
    }

    /// Returns whether the transform is close enough to identity for a node
    /// to leave its TRS fields out.
    pub fn is_identity(&self) -> bool {
        const EPSILON: f32 = 1e-2;

        self.translation.abs_diff_eq(Vec3::ZERO, EPSILON)
            && self.rotation.abs_diff_eq(Quat::IDENTITY, EPSILON)
            && self.scale.abs_diff_eq(Vec3::ONE, EPSILON)
    }
}

fn guard(length: f32) -> f32 {
    if length < 1e-8 {
        1.
    } else {
        length
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn assert_trs_eq(expected: &Trs, actual: &Trs) {
        assert!(
            expected.translation.abs_diff_eq(actual.translation, 1e-5),
            "translation: {} != {}",
            expected.translation,
            actual.translation
        );
        assert!(
            expected.rotation.abs_diff_eq(actual.rotation, 1e-5)
                || expected.rotation.abs_diff_eq(-actual.rotation, 1e-5),
            "rotation: {} != {}",
            expected.rotation,
            actual.rotation
        );
        assert!(
            expected.scale.abs_diff_eq(actual.scale, 1e-5),
            "scale: {} != {}",
            expected.scale,
            actual.scale
        );
    }

    #[test]
    fn decompose_recovers_non_uniform_scale() {
        let expected = Trs {
            translation: Vec3::new(1., 2., 3.),
            rotation: Quat::from_rotation_y(0.5),
            scale: Vec3::new(2., 3., 4.),
        };

        let actual = Trs::from_mat4(&expected.to_mat4());
        assert_trs_eq(&expected, &actual);
    }

    #[test]
    fn decompose_reads_columns() {
        // A pure scale keeps each factor in its own column. Mixing up rows
        // and columns would shuffle the recovered scale.
        let matrix = Mat4::from_scale(Vec3::new(2., 3., 4.));

        let actual = Trs::from_mat4(&matrix);
        assert_eq!(Vec3::new(2., 3., 4.), actual.scale);
        assert_eq!(Quat::IDENTITY, actual.rotation);
    }

    #[test]
    fn decompose_guards_zero_scale() {
        let mut matrix = Mat4::from_translation(Vec3::new(1., 0., 0.));
        matrix.x_axis = glam::Vec4::ZERO;

        let actual = Trs::from_mat4(&matrix);
        assert_eq!(1., actual.scale.x);
        assert!(!actual.rotation.is_nan());
    }

    #[test]
    fn identity_matrices_are_detected() {
        assert!(Trs::from_mat4(&Mat4::IDENTITY).is_identity());

        let offset = Mat4::from_translation(Vec3::new(0.5, 0., 0.));
        assert!(!Trs::from_mat4(&offset).is_identity());

        // Small authoring noise still counts as identity.
        let noise = Mat4::from_translation(Vec3::new(1e-4, -1e-4, 0.));
        assert!(Trs::from_mat4(&noise).is_identity());
    }
}

use glam::{Vec2, Vec3, Vec4};

/// Builds per-vertex tangents for a triangle list whose material needs
/// them but whose source data doesn't provide them.
///
/// Face tangents come from the UV gradient and are accumulated into the
/// face's vertices, then orthonormalized against the vertex normal; the
/// w component carries the handedness. Vertices that end up degenerate
/// (unreferenced, NaN positions, collapsed UVs) and meshes without UVs
/// at all fall back to a basis derived from the normal alone. Missing
/// normals are replaced by geometric face normals.
pub fn create_tangents(
    positions: &[Vec3],
    normals: Option<&[Vec3]>,
    uvs: Option<&[Vec2]>,
    indices: &[u32],
) -> Vec<Vec4> {
    let computed_normals;

    let normals = match normals {
        Some(normals) => normals,
        None => {
            computed_normals = face_normals(positions, indices);
            &computed_normals
        }
    };

    let mut tangents = vec![Vec4::ZERO; positions.len()];

    for face in indices.chunks_exact(3) {
        let (i0, i1, i2) =
            (face[0] as usize, face[1] as usize, face[2] as usize);

        let (p0, p1, p2) = (positions[i0], positions[i1], positions[i2]);

        let Some(uvs) = uvs else {
            let tangent = fast_tangent(normals[i0]);

            tangents[i0] = tangent;
            tangents[i1] = tangent;
            tangents[i2] = tangent;

            continue;
        };

        let edge1 = p1 - p0;
        let edge2 = p2 - p0;
        let duv1 = uvs[i1] - uvs[i0];
        let duv2 = uvs[i2] - uvs[i0];

        let det = duv1.x * duv2.y - duv2.x * duv1.y;
        let f = if det.abs() > 0.0 { 1.0 / det } else { 1.0 };

        let tangent = f * (duv2.y * edge1 - duv1.y * edge2);
        let bitangent = f * (duv2.x * edge1 - duv1.x * edge2);

        let handedness = if tangent.cross(bitangent).dot(normals[i0]) > 0.0 {
            1.0
        } else {
            -1.0
        };

        for i in [i0, i1, i2] {
            tangents[i] = (tangent + tangents[i].truncate()).extend(handedness);
        }
    }

    for (tangent, normal) in tangents.iter_mut().zip(normals) {
        let t = tangent.truncate();

        // Gram-Schmidt
        let mut ot = (t - normal.dot(t) * *normal).normalize_or_zero();

        if ot.length_squared() < 0.1 || !ot.is_finite() {
            ot = fast_tangent(*normal).truncate();
        }

        let handedness = if tangent.w < 0.0 { -1.0 } else { 1.0 };

        *tangent = ot.extend(handedness);
    }

    tangents
}

fn face_normals(positions: &[Vec3], indices: &[u32]) -> Vec<Vec3> {
    let mut normals = vec![Vec3::ZERO; positions.len()];

    for face in indices.chunks_exact(3) {
        let (i0, i1, i2) =
            (face[0] as usize, face[1] as usize, face[2] as usize);

        let normal = (positions[i1] - positions[i0])
            .cross(positions[i2] - positions[i0])
            .normalize_or_zero();

        normals[i0] = normal;
        normals[i1] = normal;
        normals[i2] = normal;
    }

    normals
}

/// Finds a valid tangent given only the normal.
///
/// Uses the technique from "Improved accuracy when building an
/// orthonormal basis" by Nelson Max; any tangent field over a sphere
/// must have a discontinuity somewhere, this one parks it in a small
/// ring near `normal.z == -0.99998796`.
fn fast_tangent(n: Vec3) -> Vec4 {
    if n.z < -0.999_987_96 {
        return Vec4::new(0.0, -1.0, 0.0, 1.0);
    }

    let a = 1.0 / (1.0 + n.z);

    Vec4::new(1.0 - n.x * n.x * a, -n.x * n.y * a, -n.x, 1.0)
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};

    use super::*;

    fn quad() -> (Vec<Vec3>, Vec<Vec3>, Vec<Vec2>, Vec<u32>) {
        let positions = vec![
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(1.0, 0.0, 0.0),
            Vec3::new(1.0, 1.0, 0.0),
            Vec3::new(0.0, 1.0, 0.0),
        ];

        let normals = vec![Vec3::Z; 4];

        let uvs = vec![
            Vec2::new(0.0, 0.0),
            Vec2::new(1.0, 0.0),
            Vec2::new(1.0, 1.0),
            Vec2::new(0.0, 1.0),
        ];

        let indices = vec![0, 1, 2, 0, 2, 3];

        (positions, normals, uvs, indices)
    }

    #[test]
    fn flat_quad_gets_the_u_axis() {
        let (positions, normals, uvs, indices) = quad();

        let tangents =
            create_tangents(&positions, Some(&normals), Some(&uvs), &indices);

        for tangent in tangents {
            assert_relative_eq!(1.0, tangent.x, epsilon = 1e-6);
            assert_relative_eq!(0.0, tangent.y, epsilon = 1e-6);
            assert_relative_eq!(0.0, tangent.z, epsilon = 1e-6);
            assert_eq!(-1.0, tangent.w);
        }
    }

    #[test]
    fn mirrored_uvs_flip_the_handedness() {
        let (positions, normals, mut uvs, indices) = quad();

        for uv in &mut uvs {
            uv.x = 1.0 - uv.x;
        }

        let straight =
            create_tangents(&positions, Some(&normals), Some(&quad().2), &indices);
        let mirrored =
            create_tangents(&positions, Some(&normals), Some(&uvs), &indices);

        for (straight, mirrored) in straight.iter().zip(&mirrored) {
            assert_eq!(straight.w, -mirrored.w);
        }
    }

    #[test]
    fn tangents_are_unit_length_and_orthogonal_to_normals() {
        let mut rng = SmallRng::seed_from_u64(42);

        let positions: Vec<_> = (0..32 * 3)
            .map(|_| {
                Vec3::new(rng.gen(), rng.gen(), rng.gen()) * 10.0
                    - Vec3::splat(5.0)
            })
            .collect();

        let normals: Vec<_> = (0..positions.len())
            .map(|_| {
                let theta = rng.gen::<f32>() * std::f32::consts::TAU;
                let z = rng.gen::<f32>() * 2.0 - 1.0;
                let r = (1.0 - z * z).sqrt();

                Vec3::new(r * theta.cos(), r * theta.sin(), z)
            })
            .collect();

        let uvs: Vec<_> = (0..positions.len())
            .map(|_| Vec2::new(rng.gen(), rng.gen()))
            .collect();

        let indices: Vec<_> = (0..positions.len() as u32).collect();

        let tangents =
            create_tangents(&positions, Some(&normals), Some(&uvs), &indices);

        for (tangent, normal) in tangents.iter().zip(&normals) {
            let t = tangent.truncate();

            assert_relative_eq!(1.0, t.length(), epsilon = 1e-4);
            assert_relative_eq!(0.0, t.dot(*normal), epsilon = 1e-4);
            assert!(tangent.w == 1.0 || tangent.w == -1.0);
        }
    }

    #[test]
    fn collapsed_uvs_still_produce_a_valid_basis() {
        let (positions, normals, _, indices) = quad();
        let uvs = vec![Vec2::ZERO; positions.len()];

        let tangents =
            create_tangents(&positions, Some(&normals), Some(&uvs), &indices);

        for (tangent, normal) in tangents.iter().zip(&normals) {
            let t = tangent.truncate();

            assert!(t.is_finite());
            assert_relative_eq!(1.0, t.length(), epsilon = 1e-4);
            assert_relative_eq!(0.0, t.dot(*normal), epsilon = 1e-4);
        }
    }

    #[test]
    fn missing_uvs_fall_back_to_the_normal_basis() {
        let (positions, normals, _, indices) = quad();

        let tangents =
            create_tangents(&positions, Some(&normals), None, &indices);

        for (tangent, normal) in tangents.iter().zip(&normals) {
            let t = tangent.truncate();

            assert_relative_eq!(1.0, t.length(), epsilon = 1e-4);
            assert_relative_eq!(0.0, t.dot(*normal), epsilon = 1e-4);
            assert_eq!(1.0, tangent.w);
        }
    }

    #[test]
    fn missing_normals_use_the_geometric_normal() {
        let (positions, _, uvs, indices) = quad();

        let tangents = create_tangents(&positions, None, Some(&uvs), &indices);

        // The quad lies in the XY plane, so the geometric normal is +-Z
        // and the tangent must stay inside the plane.
        for tangent in tangents {
            assert_relative_eq!(0.0, tangent.z, epsilon = 1e-4);
            assert_relative_eq!(
                1.0,
                tangent.truncate().length(),
                epsilon = 1e-4
            );
        }
    }

    #[test]
    fn fast_tangent_handles_the_singularity() {
        assert_eq!(
            Vec4::new(0.0, -1.0, 0.0, 1.0),
            fast_tangent(Vec3::new(0.0, 0.0, -1.0)),
        );
    }
}
